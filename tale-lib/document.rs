//! Story document: ordered sections plus their branching history.
//!
//! The document keeps three things in step:
//!
//! - the materialized section list, which always reflects every committed
//!   node on the path from the history root to the current node plus the
//!   staged changes;
//! - the [`HistoryTree`];
//! - a staged [`ChangeMap`] of edits not yet committed to a node.
//!
//! Changes are validated against a copy of the section list and only
//! swapped in when the whole map applied, so a rejected map leaves the
//! document as it was.
//!
//! # Example
//!
//! ```
//! use tale_core::Section;
//! use tale_lib::{
//!   change::HistoryStep,
//!   document::Document,
//! };
//!
//! let mut doc = Document::new();
//! let id = doc.allocate_section_id();
//! doc
//!   .push_change([(id, HistoryStep::Create {
//!     section: Section::text("Hello"),
//!     after:   None,
//!   })].into_iter().collect())
//!   .unwrap();
//! assert!(doc.push_history());
//! assert_eq!(doc.text(), "Hello");
//!
//! doc.pop_history().unwrap();
//! assert_eq!(doc.text(), "");
//! ```

use std::borrow::Cow;

use serde::{
  Deserialize,
  Serialize,
};
use tale_core::{
  DiffOptions,
  Section,
  SectionId,
  id::IdAllocator,
};
use thiserror::Error;

use crate::{
  change::{
    ChangeError,
    ChangeMap,
    HistoryStep,
    SectionList,
  },
  config::PreviewOptions,
  history::{
    Direction,
    HistoryError,
    HistoryJump,
    HistoryNodeId,
    HistoryTree,
  },
  reconcile::preview_changes,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
  #[error(transparent)]
  Change(#[from] ChangeError),
  #[error(transparent)]
  History(#[from] HistoryError),
  #[error("sections do not match the history replayed up to node {0}")]
  Diverged(HistoryNodeId),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "DocumentParts", into = "DocumentParts")]
pub struct Document {
  sections: SectionList,
  history:  HistoryTree,
  staged:   ChangeMap,
  ids:      IdAllocator,
  options:  DiffOptions,
}

/// Serialized shape of a [`Document`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentParts {
  pub sections: Vec<(SectionId, Section)>,
  pub history:  HistoryTree,
  #[serde(default, skip_serializing_if = "ChangeMap::is_empty")]
  pub staged:   ChangeMap,
}

impl Default for Document {
  fn default() -> Self {
    Self::new()
  }
}

impl Document {
  pub fn new() -> Self {
    Self::with_options(DiffOptions::default())
  }

  pub fn with_options(options: DiffOptions) -> Self {
    Self {
      sections: SectionList::new(),
      history: HistoryTree::new(),
      staged: ChangeMap::new(),
      ids: IdAllocator::new(),
      options,
    }
  }

  /// A document whose first history node creates `sections` in order.
  pub fn from_sections<I>(sections: I) -> Result<Self>
  where
    I: IntoIterator<Item = Section>,
  {
    let mut doc = Self::new();
    let mut after = None;
    let mut changes = ChangeMap::new();
    for section in sections {
      let id = doc.allocate_section_id();
      changes.insert(id, HistoryStep::Create { section, after });
      after = Some(id);
    }
    doc.push_change(changes)?;
    doc.push_history();
    Ok(doc)
  }

  /// Rebuilds a document with default diff options, checking that the
  /// sections are exactly what the history and the staged changes produce.
  ///
  /// Options are not part of the serialized form; deserialization goes
  /// through here, so set them again after loading or use
  /// [`Document::from_parts_with_options`].
  pub fn from_parts(parts: DocumentParts) -> Result<Self> {
    Self::from_parts_with_options(parts, DiffOptions::default())
  }

  pub fn from_parts_with_options(parts: DocumentParts, options: DiffOptions) -> Result<Self> {
    let DocumentParts {
      sections,
      history,
      staged,
    } = parts;
    let sections = SectionList::from_entries(sections)?;

    let mut replay = SectionList::new();
    for node in history.path_to(history.current())? {
      if let Some(node) = history.node(node) {
        replay.apply_changes(node.changes())?;
      }
    }
    replay.apply_changes(&staged)?;
    if replay != sections {
      return Err(DocumentError::Diverged(history.current()));
    }

    let mut ids = IdAllocator::new();
    let recorded = history
      .nodes()
      .flat_map(|node| node.changes().ids())
      .chain(staged.ids());
    for id in sections.iter().map(|(id, _)| id).chain(recorded) {
      ids.reserve(id);
    }

    Ok(Self {
      sections,
      history,
      staged,
      ids,
      options,
    })
  }

  pub fn options(&self) -> &DiffOptions {
    &self.options
  }

  pub fn set_options(&mut self, options: DiffOptions) {
    self.options = options;
  }

  pub fn history(&self) -> &HistoryTree {
    &self.history
  }

  pub fn current_history_node(&self) -> HistoryNodeId {
    self.history.current()
  }

  pub fn staged(&self) -> &ChangeMap {
    &self.staged
  }

  pub fn section_list(&self) -> &SectionList {
    &self.sections
  }

  pub fn sections(&self) -> impl ExactSizeIterator<Item = (SectionId, &Section)> {
    self.sections.iter()
  }

  pub fn section(&self, id: SectionId) -> Option<&Section> {
    self.sections.get(id)
  }

  pub fn len(&self) -> usize {
    self.sections.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sections.is_empty()
  }

  /// Plain text, one `\n` between sections.
  pub fn text(&self) -> String {
    self.sections.text()
  }

  /// A fresh id that no section of this document has ever used.
  pub fn allocate_section_id(&mut self) -> SectionId {
    self.ids.allocate()
  }

  /// Section holding character `pos` of [`Document::text`] and the offset
  /// inside it. `None` for an empty document.
  pub fn section_for_character_position(&self, pos: usize) -> Option<(SectionId, usize)> {
    self.sections.section_at_char(pos)
  }

  pub fn is_dirty(&self) -> bool {
    !self.staged.is_empty()
  }

  /// Applies `changes` to the sections and folds them into the staged map.
  pub fn push_change(&mut self, changes: ChangeMap) -> Result<()> {
    if changes.is_empty() {
      return Ok(());
    }
    let mut sections = self.sections.clone();
    let mut staged = self.staged.clone();
    let mut created = Vec::new();

    for (id, mut step) in changes {
      step.normalize();
      sections.apply_step(id, &step)?;
      if matches!(step, HistoryStep::Create { .. }) {
        created.push(id);
      }
      staged.merge(id, step, &sections, &self.options)?;
    }

    for id in created {
      self.ids.reserve(id);
    }
    tracing::trace!(staged = staged.len(), "staged changes");
    self.sections = sections;
    self.staged = staged;
    Ok(())
  }

  /// Commits the staged changes as a new history node.
  ///
  /// Returns false, doing nothing, when nothing is staged.
  pub fn push_history(&mut self) -> bool {
    if self.staged.is_empty() {
      return false;
    }
    let changes = std::mem::take(&mut self.staged);
    let node = self.history.push_state(changes);
    tracing::debug!(%node, "committed history node");
    true
  }

  /// Reverts the staged changes and returns them, so the editor can render
  /// them backwards.
  pub fn discard_staged(&mut self) -> Result<Option<ChangeMap>> {
    if self.staged.is_empty() {
      return Ok(None);
    }
    self.sections.undo_changes(&self.staged)?;
    Ok(Some(std::mem::take(&mut self.staged)))
  }

  /// A view of the document as if [`Document::push_history`] had been
  /// called. Borrows when nothing is staged.
  pub fn with_pushed_history(&self) -> Cow<'_, Self> {
    if !self.is_dirty() {
      return Cow::Borrowed(self);
    }
    let mut doc = self.clone();
    doc.push_history();
    Cow::Owned(doc)
  }

  pub fn can_pop_history(&self) -> bool {
    self.is_dirty() || !self.history.at_root()
  }

  pub fn can_descend_history(&self) -> bool {
    !self.is_dirty() && !self.history.current_node().children().is_empty()
  }

  /// Children of the current node, oldest first.
  pub fn descendents(&self) -> Vec<HistoryNodeId> {
    self.history.current_node().children().iter().copied().collect()
  }

  /// [`Document::descendents`] paired with a short preview of what
  /// descending into each would write.
  pub fn descendent_previews(&self, options: &PreviewOptions) -> Vec<(HistoryNodeId, String)> {
    self
      .descendents()
      .into_iter()
      .filter_map(|id| {
        let node = self.history.node(id)?;
        Some((id, preview_changes(node.changes(), options.max_chars)))
      })
      .collect()
  }

  /// Undoes the current node and moves to its parent.
  ///
  /// Staged changes are committed first. The returned map is the one that
  /// was reverted; the sections already reflect the parent state.
  /// `None` at the root.
  pub fn pop_history(&mut self) -> Result<Option<ChangeMap>> {
    self.push_history();
    let Some(jump) = self.history.undo() else {
      return Ok(None);
    };
    let mut applied = self.apply_history_jump(&jump)?;
    Ok(applied.pop().map(|(_, changes)| changes))
  }

  /// Replays a child of the current node and moves there.
  ///
  /// The child is `branch`, else the remembered route, else the first child.
  /// `None`, without changes, if `branch` is not a child of the current node,
  /// there is nothing to redo, or edits are staged (an uncommitted state has
  /// no children).
  pub fn descend_history(&mut self, branch: Option<HistoryNodeId>) -> Result<Option<ChangeMap>> {
    if self.is_dirty() {
      return Ok(None);
    }
    let Some(jump) = self.history.redo(branch) else {
      return Ok(None);
    };
    let mut applied = self.apply_history_jump(&jump)?;
    Ok(applied.pop().map(|(_, changes)| changes))
  }

  /// Moves to any node, undoing up to the common ancestor and redoing down
  /// from there. Returns every map crossed in the order it was applied, or
  /// `None` if `to` is not in the tree.
  pub fn jump_to_history(&mut self, to: HistoryNodeId) -> Result<Option<Vec<(Direction, ChangeMap)>>> {
    self.push_history();
    let jump = match self.history.jump_to(to) {
      Ok(jump) => jump,
      Err(HistoryError::UnknownNode(_)) => return Ok(None),
      Err(err) => return Err(err.into()),
    };
    self.apply_history_jump(&jump).map(Some)
  }

  fn apply_history_jump(&mut self, jump: &HistoryJump) -> Result<Vec<(Direction, ChangeMap)>> {
    let start = tracing::enabled!(tracing::Level::DEBUG).then(std::time::Instant::now);
    let mut sections = self.sections.clone();
    let mut applied = Vec::with_capacity(jump.len());
    for step in &jump.moves {
      let node = self
        .history
        .node(step.node)
        .ok_or(HistoryError::UnknownNode(step.node))?;
      let changes = node.changes().clone();
      match step.direction {
        Direction::Undo => sections.undo_changes(&changes)?,
        Direction::Redo => sections.apply_changes(&changes)?,
      }
      applied.push((step.direction, changes));
    }
    self.history.apply_jump(jump)?;
    self.sections = sections;

    if let Some(start) = start {
      tracing::debug!(
        target = %jump.target,
        moves = jump.len(),
        elapsed = ?start.elapsed(),
        "moved through history"
      );
    }
    Ok(applied)
  }
}

impl TryFrom<DocumentParts> for Document {
  type Error = DocumentError;

  fn try_from(parts: DocumentParts) -> Result<Self> {
    Self::from_parts(parts)
  }
}

impl From<Document> for DocumentParts {
  fn from(doc: Document) -> Self {
    Self {
      sections: doc.sections.entries().to_vec(),
      history:  doc.history,
      staged:   doc.staged,
    }
  }
}
