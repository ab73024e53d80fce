//! Translation between section-level changes and an editor's blocks.
//!
//! The editor is seen through [`EditorSurface`]: an ordered list of blocks,
//! one per section, addressed by index, with marks and highlights stamped
//! over character ranges. Positions count characters, with one separator
//! between consecutive blocks, the same way
//! [`Document::section_for_character_position`] counts them.
//!
//! Going out, [`render_changes`] turns a [`ChangeMap`] into block inserts,
//! replacements and removals. Coming in, [`capture_changes`] turns the
//! editor's per-node events into a [`ChangeMap`] for
//! [`Document::push_change`].

use std::{
  collections::HashMap,
  ops::Range,
};

use indexmap::IndexMap;
use tale_core::{
  MetaKind,
  MetaRange,
  Section,
  SectionDiff,
  SectionId,
  TextSection,
  diff::diff_with,
};

use crate::{
  change::{
    ChangeMap,
    HistoryStep,
  },
  document::{
    Document,
    Result,
  },
  history::Direction,
};

/// A metadata range as stamped onto editor text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mark {
  pub kind: MetaKind,
  pub data: i32,
}

/// Transient highlight shown after moving through history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Highlight {
  /// Text that a redo put back.
  Inserted,
  /// Text that an undo put back.
  Restored,
}

pub trait EditorSurface {
  fn block_count(&self) -> usize;

  fn block_id(&self, index: usize) -> Option<SectionId>;

  fn block_index(&self, id: SectionId) -> Option<usize>;

  /// Length in characters of the text of block `index`.
  fn block_len(&self, index: usize) -> usize;

  fn insert_block(&mut self, index: usize, id: SectionId, text: &str);

  /// Replaces the whole text of a block, dropping its marks and highlights.
  fn replace_block_text(&mut self, index: usize, text: &str);

  fn remove_block(&mut self, index: usize);

  fn add_mark(&mut self, from: usize, until: usize, mark: Mark);

  fn add_highlight(&mut self, from: usize, until: usize, highlight: Highlight);

  /// Position of the first character of block `index`.
  fn block_start(&self, index: usize) -> usize {
    (0..index).map(|i| self.block_len(i) + 1).sum()
  }

  /// Length of the whole rendered text.
  fn text_len(&self) -> usize {
    match self.block_count() {
      0 => 0,
      count => self.block_start(count - 1) + self.block_len(count - 1),
    }
  }
}

/// Where the cursor should go once a map has been rendered.
#[derive(Debug, Clone, Copy)]
struct CursorHint {
  block:  Option<SectionId>,
  offset: usize,
}

impl CursorHint {
  fn resolve<S: EditorSurface + ?Sized>(self, surface: &S) -> usize {
    match self.block.and_then(|id| surface.block_index(id)) {
      Some(index) => surface.block_start(index) + self.offset.min(surface.block_len(index)),
      None => surface.text_len(),
    }
  }
}

/// Renders `changes` onto `surface`, replaying them for
/// [`Direction::Redo`] and reverting them for [`Direction::Undo`].
///
/// `document` must already be in the state the changes lead to; block
/// contents are taken from its sections. Returns a suggested cursor
/// position, `None` for an empty map.
pub fn render_changes<S>(
  surface: &mut S,
  document: &Document,
  changes: &ChangeMap,
  direction: Direction,
) -> Option<usize>
where
  S: EditorSurface + ?Sized,
{
  let mut cursor = None;
  let mut steps: Vec<_> = changes.iter().collect();
  if direction == Direction::Undo {
    steps.reverse();
  }

  for (id, step) in steps {
    tracing::trace!(%id, ?direction, "rendering step");
    let hint = match (step, direction) {
      (HistoryStep::Create { section, after }, Direction::Redo)
      | (HistoryStep::Remove { previous: section, after }, Direction::Undo) => {
        let section = document.section(id).unwrap_or(section);
        insert_section(surface, id, section, *after)
      },
      (HistoryStep::Create { .. }, Direction::Undo)
      | (HistoryStep::Remove { .. }, Direction::Redo) => remove_section(surface, id),
      (HistoryStep::Update { diff }, _) => {
        let Some(section) = document.section(id) else {
          tracing::warn!(%id, "updated section is missing from the document");
          continue;
        };
        let Some(index) = surface.block_index(id) else {
          tracing::warn!(%id, "updated section has no block, skipping");
          continue;
        };
        surface.replace_block_text(index, section.plain_text());
        stamp_section(surface, index, section);
        let changed = diff.as_text().and_then(|delta| match direction {
          Direction::Redo => delta.inserted_ranges().last().map(|range| range.end),
          Direction::Undo => delta.deleted_ranges().last().map(|range| range.end),
        });
        CursorHint {
          block:  Some(id),
          offset: changed.unwrap_or(usize::MAX),
        }
      },
    };
    cursor = Some(hint);
  }

  cursor.map(|hint| hint.resolve(surface))
}

fn insert_section<S>(surface: &mut S, id: SectionId, section: &Section, after: Option<SectionId>) -> CursorHint
where
  S: EditorSurface + ?Sized,
{
  let index = match surface.block_index(id) {
    Some(index) => {
      tracing::warn!(%id, "inserted section already has a block, replacing it");
      surface.replace_block_text(index, section.plain_text());
      index
    },
    None => {
      let index = match after {
        None => 0,
        Some(after) => surface.block_index(after).map_or_else(
          || {
            tracing::warn!(%id, %after, "anchor block is gone, inserting at the end");
            surface.block_count()
          },
          |index| index + 1,
        ),
      };
      surface.insert_block(index, id, section.plain_text());
      index
    },
  };
  stamp_section(surface, index, section);
  CursorHint {
    block:  Some(id),
    offset: usize::MAX,
  }
}

fn remove_section<S>(surface: &mut S, id: SectionId) -> CursorHint
where
  S: EditorSurface + ?Sized,
{
  let Some(index) = surface.block_index(id) else {
    tracing::warn!(%id, "removed section has no block");
    return CursorHint {
      block:  None,
      offset: 0,
    };
  };
  surface.remove_block(index);
  match surface.block_id(index) {
    Some(next) => CursorHint {
      block:  Some(next),
      offset: 0,
    },
    None => CursorHint {
      block:  index.checked_sub(1).and_then(|prev| surface.block_id(prev)),
      offset: usize::MAX,
    },
  }
}

/// Stamps every metadata range of `section` onto block `index`.
pub fn stamp_section<S>(surface: &mut S, index: usize, section: &Section) -> usize
where
  S: EditorSurface + ?Sized,
{
  let Section::Text(text) = section else {
    return 0;
  };
  let start = surface.block_start(index);
  let end = start + surface.block_len(index);
  text
    .meta
    .iter()
    .map(|(kind, ranges)| stamp_marks(surface, start, end, *kind, ranges))
    .sum()
}

/// Stamps `ranges`, relative to `start`, as marks of `kind`.
///
/// A range of length zero extends to `end`. Ranges reaching past `end` are
/// clamped and ranges left empty are skipped, both with a warning. Returns
/// the number of marks stamped.
pub fn stamp_marks<S>(surface: &mut S, start: usize, end: usize, kind: MetaKind, ranges: &[MetaRange]) -> usize
where
  S: EditorSurface + ?Sized,
{
  let mut stamped = 0;
  for range in ranges {
    let from = start + range.position;
    let mut until = if range.length > 0 { from + range.length } else { end };
    if until > end {
      tracing::warn!(%kind, from, until, end, "mark range runs past its block, clamping");
      until = end;
    }
    if until <= from {
      tracing::warn!(%kind, from, until, "skipping empty mark range");
      continue;
    }
    surface.add_mark(from, until, Mark {
      kind,
      data: range.data,
    });
    stamped += 1;
  }
  stamped
}

/// Highlights the text that moving in `direction` through `changes` put
/// back: insertions for a redo, deletions for an undo.
pub fn highlight_changes<S>(surface: &mut S, changes: &ChangeMap, direction: Direction) -> usize
where
  S: EditorSurface + ?Sized,
{
  let mut count = 0;
  for (id, step) in changes.iter() {
    let HistoryStep::Update { diff } = step else {
      continue;
    };
    let Some(delta) = diff.as_text() else {
      continue;
    };
    let Some(index) = surface.block_index(id) else {
      continue;
    };
    let (ranges, highlight) = match direction {
      Direction::Redo => (delta.inserted_ranges(), Highlight::Inserted),
      Direction::Undo => (delta.deleted_ranges(), Highlight::Restored),
    };
    let start = surface.block_start(index);
    let len = surface.block_len(index);
    for Range { start: from, end: until } in ranges {
      let until = until.min(len);
      if until > from {
        surface.add_highlight(start + from, start + until, highlight);
        count += 1;
      }
    }
  }
  count
}

/// A top-level editor node as seen right after an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
  pub id:      SectionId,
  pub section: Section,
}

/// What the editor reports for one section id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeEvent {
  /// The node now, `None` if it was deleted.
  pub node:     Option<NodeSnapshot>,
  /// The node right before it now, `None` at the start of the document.
  pub previous: Option<NodeSnapshot>,
}

/// Builds the map that takes `document` to what the editor shows.
///
/// Updates come first, then creations in an order where every creation
/// follows the one it is anchored to, then removals from the end of the
/// document backwards.
pub fn capture_changes(document: &Document, events: &IndexMap<SectionId, NodeEvent>) -> ChangeMap {
  let options = document.options();
  let mut updates = Vec::new();
  let mut creates: IndexMap<SectionId, (Section, Option<SectionId>)> = IndexMap::new();
  let mut removes = Vec::new();

  for (id, event) in events {
    let id = *id;
    match (&event.node, document.section(id)) {
      (Some(node), Some(known)) => {
        let diff = diff_with(known, &node.section, options);
        if !diff.is_empty() {
          updates.push((id, HistoryStep::Update { diff }));
        }
      },
      (Some(node), None) => {
        let after = event.previous.as_ref().map(|previous| previous.id);
        creates.insert(id, (node.section.clone(), after));
      },
      (None, Some(known)) => {
        let position = document.section_list().position(id).unwrap_or(0);
        removes.push((position, id, HistoryStep::Remove {
          previous: known.clone(),
          after:    document.section_list().predecessor(id),
        }));
      },
      (None, None) => tracing::trace!(%id, "ignoring event for a node that never existed"),
    }
  }

  let mut changes: ChangeMap = updates.into_iter().collect();
  while !creates.is_empty() {
    let ready = creates
      .iter()
      .position(|(_, (_, after))| after.is_none_or(|after| !creates.contains_key(&after)))
      .unwrap_or_else(|| {
        tracing::warn!("created nodes anchor on each other in a cycle");
        0
      });
    if let Some((id, (section, after))) = creates.shift_remove_index(ready) {
      changes.insert(id, HistoryStep::Create { section, after });
    }
  }

  removes.sort_by(|a, b| b.0.cmp(&a.0));
  for (_, id, step) in removes {
    changes.insert(id, step);
  }
  changes
}

/// Short human-readable summary of what applying `changes` writes.
///
/// Shows the inserted text, or the deleted text prefixed with `-` when the
/// map only deletes. Cut to `max_chars` characters.
pub fn preview_changes(changes: &ChangeMap, max_chars: usize) -> String {
  let mut inserted = Vec::new();
  let mut deleted = Vec::new();
  for (_, step) in changes.iter() {
    match step {
      HistoryStep::Create { section, .. } => inserted.push(section.plain_text().to_owned()),
      HistoryStep::Remove { previous, .. } => deleted.push(previous.plain_text().to_owned()),
      HistoryStep::Update { diff } => match diff.as_text() {
        Some(delta) => {
          for part in &delta.parts {
            inserted.push(part.insert.clone());
            deleted.push(part.delete.clone());
          }
        },
        None => {
          if let SectionDiff::Replace { to, .. } = diff {
            inserted.push(to.plain_text().to_owned());
          }
        },
      },
    }
  }

  let join = |pieces: Vec<String>| {
    pieces
      .iter()
      .map(|piece| piece.trim())
      .filter(|piece| !piece.is_empty())
      .collect::<Vec<_>>()
      .join(" ")
      .replace('\n', " ")
  };
  let text = match join(inserted) {
    text if !text.is_empty() => text,
    _ => match join(deleted) {
      text if !text.is_empty() => format!("-{text}"),
      _ => String::new(),
    },
  };

  if text.chars().count() <= max_chars {
    return text;
  }
  let mut cut: String = text.chars().take(max_chars).collect();
  cut.push('…');
  cut
}

/// Phase of one editing session over a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
  #[default]
  Idle,
  Editing,
  Committed,
  Discarded,
}

/// What ended an editing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTrigger {
  Blur,
  Save,
  Generation,
}

/// Tracks a run of editor edits until they are committed or thrown away.
#[derive(Debug, Default)]
pub struct EditSession {
  state: SessionState,
}

impl EditSession {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  /// Captures `events` and stages them on `document`.
  pub fn record(&mut self, document: &mut Document, events: &IndexMap<SectionId, NodeEvent>) -> Result<ChangeMap> {
    let changes = capture_changes(document, events);
    if !changes.is_empty() {
      document.push_change(changes.clone())?;
      self.state = SessionState::Editing;
    }
    Ok(changes)
  }

  /// Commits staged edits. Returns whether a history node was created.
  pub fn commit(&mut self, document: &mut Document, trigger: CommitTrigger) -> bool {
    let committed = document.push_history();
    if committed {
      tracing::debug!(?trigger, "committed edit session");
      self.state = SessionState::Committed;
    }
    committed
  }

  /// Drops staged edits, returning them for backward rendering.
  pub fn discard(&mut self, document: &mut Document) -> Result<Option<ChangeMap>> {
    let dropped = document.discard_staged()?;
    if dropped.is_some() {
      self.state = SessionState::Discarded;
    }
    Ok(dropped)
  }
}

/// One block of a [`BlockView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
  pub id:         SectionId,
  pub text:       String,
  /// Marks relative to the block start.
  pub marks:      Vec<(Range<usize>, Mark)>,
  pub highlights: Vec<(Range<usize>, Highlight)>,
}

impl Block {
  fn len(&self) -> usize {
    self.text.chars().count()
  }
}

/// In-memory [`EditorSurface`] with an id → index table.
#[derive(Debug, Clone, Default)]
pub struct BlockView {
  blocks: Vec<Block>,
  index:  HashMap<SectionId, usize>,
}

impl BlockView {
  pub fn new() -> Self {
    Self::default()
  }

  /// Renders every section of `document`.
  pub fn from_document(document: &Document) -> Self {
    let mut view = Self::new();
    for (position, (id, section)) in document.sections().enumerate() {
      view.insert_block(position, id, section.plain_text());
      stamp_section(&mut view, position, section);
    }
    view
  }

  pub fn blocks(&self) -> &[Block] {
    &self.blocks
  }

  pub fn text(&self) -> String {
    let texts: Vec<_> = self.blocks.iter().map(|block| block.text.as_str()).collect();
    texts.join("\n")
  }

  /// The block read back as a text section, marks turned into metadata.
  pub fn snapshot(&self, index: usize) -> Option<NodeSnapshot> {
    let block = self.blocks.get(index)?;
    let mut meta: HashMap<MetaKind, Vec<MetaRange>> = HashMap::new();
    for (range, mark) in &block.marks {
      meta
        .entry(mark.kind)
        .or_default()
        .push(MetaRange::new(range.start, range.len(), mark.data));
    }
    let mut section = TextSection::new(block.text.clone());
    for (kind, mut ranges) in meta {
      ranges.sort_by_key(|range| range.position);
      section.set_meta(kind, ranges);
    }
    Some(NodeSnapshot {
      id:      block.id,
      section: Section::Text(section),
    })
  }

  /// Locates the block containing `[from, until)` and rebases the range.
  fn local(&self, from: usize, until: usize) -> Option<(usize, Range<usize>)> {
    let mut start = 0;
    for (index, block) in self.blocks.iter().enumerate() {
      let end = start + block.len();
      if from >= start && until <= end {
        return Some((index, from - start..until - start));
      }
      start = end + 1;
    }
    None
  }

  fn reindex(&mut self, from: usize) {
    for (position, block) in self.blocks.iter().enumerate().skip(from) {
      self.index.insert(block.id, position);
    }
  }
}

impl EditorSurface for BlockView {
  fn block_count(&self) -> usize {
    self.blocks.len()
  }

  fn block_id(&self, index: usize) -> Option<SectionId> {
    self.blocks.get(index).map(|block| block.id)
  }

  fn block_index(&self, id: SectionId) -> Option<usize> {
    self.index.get(&id).copied()
  }

  fn block_len(&self, index: usize) -> usize {
    self.blocks.get(index).map_or(0, Block::len)
  }

  fn insert_block(&mut self, index: usize, id: SectionId, text: &str) {
    let index = index.min(self.blocks.len());
    self.blocks.insert(index, Block {
      id,
      text: text.to_owned(),
      marks: Vec::new(),
      highlights: Vec::new(),
    });
    self.reindex(index);
  }

  fn replace_block_text(&mut self, index: usize, text: &str) {
    if let Some(block) = self.blocks.get_mut(index) {
      block.text = text.to_owned();
      block.marks.clear();
      block.highlights.clear();
    }
  }

  fn remove_block(&mut self, index: usize) {
    if index < self.blocks.len() {
      let block = self.blocks.remove(index);
      self.index.remove(&block.id);
      self.reindex(index);
    }
  }

  fn add_mark(&mut self, from: usize, until: usize, mark: Mark) {
    if let Some((index, range)) = self.local(from, until) {
      self.blocks[index].marks.push((range, mark));
    }
  }

  fn add_highlight(&mut self, from: usize, until: usize, highlight: Highlight) {
    if let Some((index, range)) = self.local(from, until) {
      self.blocks[index].highlights.push((range, highlight));
    }
  }
}
