//! Per-section history steps and the ordered section list they act on.
//!
//! A [`ChangeMap`] holds at most one [`HistoryStep`] per section, in the
//! order the sections were first touched. Steps are applied front to back
//! and undone back to front, so a step's `after` reference is always
//! resolved against the list as it was when the step was recorded.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{
  Deserialize,
  Serialize,
};
use tale_core::{
  Section,
  SectionDiff,
  SectionId,
  diff::{
    DiffError,
    DiffOptions,
    diff_with,
  },
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChangeError>;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChangeError {
  #[error("section {0} does not exist")]
  UnknownSection(SectionId),
  #[error("section {0} already exists")]
  DuplicateSection(SectionId),
  #[error("section {0} was removed and cannot be created again in the same step")]
  SectionIdReused(SectionId),
  #[error("section {0} would be left with unnormalized metadata")]
  UnnormalizedMeta(SectionId),
  #[error("diff for section {id} does not fit: {source}")]
  Diff {
    id:     SectionId,
    #[source]
    source: DiffError,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStep {
  Create {
    section: Section,
    after:   Option<SectionId>,
  },
  Update {
    diff: SectionDiff,
  },
  Remove {
    previous: Section,
    after:    Option<SectionId>,
  },
}

impl HistoryStep {
  /// Normalizes the metadata of the snapshot a creation or removal carries.
  pub fn normalize(&mut self) {
    match self {
      Self::Create { section, .. } | Self::Remove { previous: section, .. } => section.normalize(),
      Self::Update { .. } => {},
    }
  }

  pub fn after(&self) -> Option<SectionId> {
    match self {
      Self::Create { after, .. } | Self::Remove { after, .. } => *after,
      Self::Update { .. } => None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeMap(IndexMap<SectionId, HistoryStep>);

impl ChangeMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn get(&self, id: SectionId) -> Option<&HistoryStep> {
    self.0.get(&id)
  }

  pub fn contains(&self, id: SectionId) -> bool {
    self.0.contains_key(&id)
  }

  /// Sets the step for `id`, replacing any previous one in place.
  pub fn insert(&mut self, id: SectionId, step: HistoryStep) -> Option<HistoryStep> {
    self.0.insert(id, step)
  }

  pub fn iter(&self) -> impl DoubleEndedIterator<Item = (SectionId, &HistoryStep)> {
    self.0.iter().map(|(id, step)| (*id, step))
  }

  pub fn ids(&self) -> impl Iterator<Item = SectionId> + '_ {
    self.0.keys().copied()
  }

  /// Folds `step` into the map.
  ///
  /// `live` is the section list right after `step` was applied to it. The
  /// result still holds a single step per section that takes the state
  /// before the first merged step to `live`.
  pub fn merge(&mut self, id: SectionId, step: HistoryStep, live: &SectionList, options: &DiffOptions) -> Result<()> {
    let fit = |source| ChangeError::Diff { id, source };
    let Some(existing) = self.0.get_mut(&id) else {
      if !matches!(&step, HistoryStep::Update { diff } if diff.is_empty()) {
        self.0.insert(id, step);
      }
      return Ok(());
    };

    match (existing, step) {
      (HistoryStep::Remove { .. }, _) => Err(ChangeError::SectionIdReused(id)),
      (_, HistoryStep::Create { .. }) => Err(ChangeError::DuplicateSection(id)),
      (HistoryStep::Create { section, .. }, HistoryStep::Update { diff }) => {
        *section = diff.apply(section).map_err(fit)?;
        Ok(())
      },
      (HistoryStep::Create { .. }, remove @ HistoryStep::Remove { .. }) => {
        // Steps recorded while the section existed may be anchored on it, so
        // the map is rebuilt from the state before it.
        let mut base = live.clone();
        base.undo_step(id, &remove)?;
        base.undo_changes(self)?;
        *self = self.rebuild(&base, live);
        Ok(())
      },
      (HistoryStep::Update { diff: first }, HistoryStep::Update { diff: second }) => {
        let latest = live.get(id).ok_or(ChangeError::UnknownSection(id))?;
        let current = second.undo(latest).map_err(fit)?;
        let original = first.undo(&current).map_err(fit)?;
        let combined = diff_with(&original, latest, options);
        if combined.is_empty() {
          self.0.shift_remove(&id);
        } else {
          *first = combined;
        }
        Ok(())
      },
      (HistoryStep::Update { diff }, HistoryStep::Remove { previous, after }) => {
        let original = diff.undo(&previous).map_err(fit)?;
        // A removal moves to the end: steps recorded in between may still
        // reference this section as their `after`.
        self.0.shift_remove(&id);
        self.0.insert(id, HistoryStep::Remove {
          previous: original,
          after,
        });
        Ok(())
      },
    }
  }

  /// The map taking `base` to `live`, reusing the updates of `self`.
  ///
  /// Updates come first, then removals from the end of `base` backwards,
  /// then creations in `live` order, each after its predecessor in `live`.
  fn rebuild(&self, base: &SectionList, live: &SectionList) -> Self {
    let mut changes: Self = self
      .iter()
      .filter(|(id, step)| matches!(step, HistoryStep::Update { .. }) && live.contains(*id))
      .map(|(id, step)| (id, step.clone()))
      .collect();

    let entries = base.entries();
    for (position, (id, previous)) in entries.iter().enumerate().rev() {
      if !live.contains(*id) {
        changes.insert(*id, HistoryStep::Remove {
          previous: previous.clone(),
          after:    position.checked_sub(1).map(|before| entries[before].0),
        });
      }
    }

    let mut after = None;
    for (id, section) in live.iter() {
      if !base.contains(id) {
        changes.insert(id, HistoryStep::Create {
          section: section.clone(),
          after,
        });
      }
      after = Some(id);
    }
    changes
  }
}

impl FromIterator<(SectionId, HistoryStep)> for ChangeMap {
  fn from_iter<I: IntoIterator<Item = (SectionId, HistoryStep)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl IntoIterator for ChangeMap {
  type Item = (SectionId, HistoryStep);
  type IntoIter = indexmap::map::IntoIter<SectionId, HistoryStep>;

  fn into_iter(self) -> Self::IntoIter {
    self.0.into_iter()
  }
}

/// Ordered sections with an id → position table kept alongside.
#[derive(Debug, Clone, Default)]
pub struct SectionList {
  entries: Vec<(SectionId, Section)>,
  index:   HashMap<SectionId, usize>,
}

impl PartialEq for SectionList {
  fn eq(&self, other: &Self) -> bool {
    self.entries == other.entries
  }
}

impl Eq for SectionList {}

impl SectionList {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_entries(entries: Vec<(SectionId, Section)>) -> Result<Self> {
    let mut index = HashMap::with_capacity(entries.len());
    for (position, (id, _)) in entries.iter().enumerate() {
      if index.insert(*id, position).is_some() {
        return Err(ChangeError::DuplicateSection(*id));
      }
    }
    Ok(Self { entries, index })
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, id: SectionId) -> Option<&Section> {
    self.position(id).map(|position| &self.entries[position].1)
  }

  pub fn position(&self, id: SectionId) -> Option<usize> {
    self.index.get(&id).copied()
  }

  pub fn contains(&self, id: SectionId) -> bool {
    self.index.contains_key(&id)
  }

  /// The section right before `id`, `None` if `id` is first or unknown.
  pub fn predecessor(&self, id: SectionId) -> Option<SectionId> {
    let position = self.position(id)?;
    position
      .checked_sub(1)
      .map(|previous| self.entries[previous].0)
  }

  pub fn iter(&self) -> impl ExactSizeIterator<Item = (SectionId, &Section)> {
    self.entries.iter().map(|(id, section)| (*id, section))
  }

  pub fn entries(&self) -> &[(SectionId, Section)] {
    &self.entries
  }

  /// Plain text of all sections, one `\n` between sections.
  pub fn text(&self) -> String {
    let mut out = String::new();
    for (position, (_, section)) in self.entries.iter().enumerate() {
      if position > 0 {
        out.push('\n');
      }
      out.push_str(section.plain_text());
    }
    out
  }

  /// Total length in characters of [`SectionList::text`].
  pub fn len_chars(&self) -> usize {
    let content: usize = self.entries.iter().map(|(_, s)| s.len_chars()).sum();
    content + self.entries.len().saturating_sub(1)
  }

  /// Section containing character `pos` of [`SectionList::text`] and the
  /// offset inside it.
  ///
  /// A position on a separator belongs to the end of the section before it;
  /// positions past the end land at the end of the last section.
  pub fn section_at_char(&self, pos: usize) -> Option<(SectionId, usize)> {
    let mut start = 0;
    for (id, section) in &self.entries {
      let len = section.len_chars();
      if pos <= start + len {
        return Some((*id, pos - start));
      }
      start += len + 1;
    }
    self
      .entries
      .last()
      .map(|(id, section)| (*id, section.len_chars()))
  }

  /// Inserts after `after`, at the start for `None`, or at the end when
  /// `after` is not in the list. Returns false in that last case.
  pub fn insert_after(&mut self, id: SectionId, section: Section, after: Option<SectionId>) -> Result<bool> {
    if self.contains(id) {
      return Err(ChangeError::DuplicateSection(id));
    }
    let (position, found) = match after {
      None => (0, true),
      Some(after) => match self.position(after) {
        Some(position) => (position + 1, true),
        None => {
          tracing::warn!(%id, %after, "insertion anchor is gone, appending section at the end");
          (self.entries.len(), false)
        },
      },
    };
    self.entries.insert(position, (id, section));
    self.reindex(position);
    Ok(found)
  }

  pub fn replace(&mut self, id: SectionId, section: Section) -> Result<Section> {
    let position = self.position(id).ok_or(ChangeError::UnknownSection(id))?;
    Ok(std::mem::replace(&mut self.entries[position].1, section))
  }

  pub fn remove(&mut self, id: SectionId) -> Result<Section> {
    let position = self.index.remove(&id).ok_or(ChangeError::UnknownSection(id))?;
    let (_, section) = self.entries.remove(position);
    self.reindex(position);
    Ok(section)
  }

  fn reindex(&mut self, from: usize) {
    for (position, (id, _)) in self.entries.iter().enumerate().skip(from) {
      self.index.insert(*id, position);
    }
  }

  /// Applies one step going forward.
  pub fn apply_step(&mut self, id: SectionId, step: &HistoryStep) -> Result<()> {
    match step {
      HistoryStep::Create { section, after } => {
        self.insert_after(id, section.clone(), *after)?;
      },
      HistoryStep::Update { diff } => {
        let current = self.get(id).ok_or(ChangeError::UnknownSection(id))?;
        let next = diff
          .apply(current)
          .map_err(|source| ChangeError::Diff { id, source })?;
        if !next.is_normalized() {
          return Err(ChangeError::UnnormalizedMeta(id));
        }
        self.replace(id, next)?;
      },
      HistoryStep::Remove { previous, .. } => {
        let current = self.get(id).ok_or(ChangeError::UnknownSection(id))?;
        if current != previous {
          return Err(ChangeError::Diff {
            id,
            source: DiffError::SnapshotMismatch,
          });
        }
        self.remove(id)?;
      },
    }
    Ok(())
  }

  /// Reverts one step.
  pub fn undo_step(&mut self, id: SectionId, step: &HistoryStep) -> Result<()> {
    match step {
      HistoryStep::Create { .. } => {
        self.remove(id)?;
      },
      HistoryStep::Update { diff } => {
        let current = self.get(id).ok_or(ChangeError::UnknownSection(id))?;
        let previous = diff
          .undo(current)
          .map_err(|source| ChangeError::Diff { id, source })?;
        self.replace(id, previous)?;
      },
      HistoryStep::Remove { previous, after } => {
        self.insert_after(id, previous.clone(), *after)?;
      },
    }
    Ok(())
  }

  /// Applies every step of `changes`. On error the list is left untouched.
  pub fn apply_changes(&mut self, changes: &ChangeMap) -> Result<()> {
    let mut next = self.clone();
    for (id, step) in changes.iter() {
      next.apply_step(id, step)?;
    }
    *self = next;
    Ok(())
  }

  /// Reverts every step of `changes`. On error the list is left untouched.
  pub fn undo_changes(&mut self, changes: &ChangeMap) -> Result<()> {
    let mut next = self.clone();
    for (id, step) in changes.iter().rev() {
      next.undo_step(id, step)?;
    }
    *self = next;
    Ok(())
  }
}
