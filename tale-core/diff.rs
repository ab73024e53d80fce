//! Invertible diffs between two snapshots of one section.
//!
//! A [`SectionDiff`] is either a whole-snapshot [`SectionDiff::Replace`] or a
//! [`TextDelta`]: a positional edit script over the text plus, per metadata
//! kind, index-matched deltas over the range arrays. Both carry enough
//! information to run in either direction, so for any `a` and `b`:
//!
//! ```
//! use tale_core::{
//!   diff::diff,
//!   section::Section,
//! };
//!
//! let a = Section::text("Hello");
//! let b = Section::text("Hello, world");
//! let delta = diff(&a, &b);
//! assert_eq!(delta.apply(&a).unwrap(), b);
//! assert_eq!(delta.undo(&b).unwrap(), a);
//! ```
//!
//! # Metadata deltas
//!
//! The range arrays of `from` and `to` are walked side by side by index.
//! Where both have a range the delta stores the difference in position,
//! length and data; a length change is cascaded onto the position of every
//! later range when applied, so one grown range does not turn every range
//! after it into a delta. Ranges present only in `from` are stored whole as
//! [`MetaRangeDelta::Removed`] (the array is truncated at the first one on
//! apply and the snapshots are appended back on undo); ranges present only
//! in `to` are stored whole as [`MetaRangeDelta::Added`].

use std::{
  collections::BTreeMap,
  ops::Range,
  time::Instant,
};

use serde::{
  Deserialize,
  Serialize,
};
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
  meta::{
    MetaKind,
    MetaRange,
  },
  section::{
    Section,
    TextSection,
  },
  text_diff::{
    Edit,
    diff_text,
  },
};

pub type Result<T> = std::result::Result<T, DiffError>;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiffError {
  #[error("text diff cannot be applied to a {found} section")]
  NotText { found: &'static str },
  #[error("section does not match the snapshot the diff was built from")]
  SnapshotMismatch,
  #[error("text part at {at} spanning {len} characters is out of bounds for length {text_len}")]
  PartOutOfBounds {
    at:       usize,
    len:      usize,
    text_len: usize,
  },
  #[error("expected {expected:?} at {at}, found {found:?}")]
  TextMismatch {
    at:       usize,
    expected: String,
    found:    String,
  },
  #[error("{kind} delta for range {index} is out of bounds for {len} ranges")]
  MetaOutOfBounds {
    kind:  MetaKind,
    index: usize,
    len:   usize,
  },
  #[error("{kind} delta for range {index} produces an unrepresentable range")]
  MetaOverflow { kind: MetaKind, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffOptions {
  /// Cost, in characters, of one edit. Equal runs shorter than this that
  /// sit between edits are absorbed into them.
  pub edit_cost:      usize,
  /// Above this many changed characters the text is not diffed character
  /// by character but replaced as one part.
  pub max_diff_chars: usize,
}

impl Default for DiffOptions {
  fn default() -> Self {
    Self {
      edit_cost:      4,
      max_diff_chars: 100_000,
    }
  }
}

/// One step of the text edit script.
///
/// Starting from the end of the previous part, skip `from_offset` unchanged
/// characters, then `delete` is replaced by `insert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPart {
  pub from_offset: usize,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub insert:      String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub delete:      String,
}

impl TextPart {
  pub fn is_empty(&self) -> bool {
    self.insert.is_empty() && self.delete.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaRangeDelta {
  /// Range `index` exists on both sides and changed.
  Shift {
    index:          usize,
    position_delta: isize,
    length_delta:   isize,
    data_delta:     i64,
  },
  /// Range `index` exists only in the new state.
  Added { index: usize, range: MetaRange },
  /// Range `index` exists only in the old state.
  Removed { index: usize, range: MetaRange },
}

impl MetaRangeDelta {
  pub const fn index(&self) -> usize {
    match self {
      Self::Shift { index, .. } | Self::Added { index, .. } | Self::Removed { index, .. } => *index,
    }
  }
}

pub type MetaDiffs = BTreeMap<MetaKind, Vec<MetaRangeDelta>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextDelta {
  pub parts: SmallVec<[TextPart; 2]>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub meta:  MetaDiffs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionDiff {
  Replace { from: Section, to: Section },
  Text(TextDelta),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
  Apply,
  Undo,
}

/// Diffs two snapshots with [`DiffOptions::default`].
pub fn diff(from: &Section, to: &Section) -> SectionDiff {
  diff_with(from, to, &DiffOptions::default())
}

pub fn diff_with(from: &Section, to: &Section, options: &DiffOptions) -> SectionDiff {
  match (from, to) {
    (Section::Text(from), Section::Text(to)) => {
      SectionDiff::Text(diff_text_sections(from, to, options))
    },
    _ => SectionDiff::Replace {
      from: from.clone(),
      to:   to.clone(),
    },
  }
}

fn diff_text_sections(from: &TextSection, to: &TextSection, options: &DiffOptions) -> TextDelta {
  let start = tracing::enabled!(tracing::Level::DEBUG).then(Instant::now);
  let edits = diff_text(&from.text, &to.text, options.edit_cost, options.max_diff_chars);
  let delta = TextDelta {
    parts: fold_parts(edits),
    meta:  diff_meta(from, to),
  };
  if let Some(start) = start {
    tracing::debug!(
      parts = delta.parts.len(),
      "section diff took {}s",
      Instant::now().duration_since(start).as_secs_f64()
    );
  }
  delta
}

/// Folds an edit script into parts, one per run of edits between equalities.
fn fold_parts(edits: Vec<Edit>) -> SmallVec<[TextPart; 2]> {
  let mut parts = SmallVec::new();
  let mut offset = 0;
  let mut pending: Option<TextPart> = None;
  for edit in edits {
    match edit {
      Edit::Equal(text) => {
        parts.extend(pending.take());
        offset += text.chars().count();
      },
      Edit::Delete(text) => {
        pending
          .get_or_insert_with(|| new_part(&mut offset))
          .delete
          .push_str(&text);
      },
      Edit::Insert(text) => {
        pending
          .get_or_insert_with(|| new_part(&mut offset))
          .insert
          .push_str(&text);
      },
    }
  }
  parts.extend(pending.filter(|part| !part.is_empty()));
  parts
}

fn new_part(offset: &mut usize) -> TextPart {
  TextPart {
    from_offset: std::mem::take(offset),
    insert:      String::new(),
    delete:      String::new(),
  }
}

fn signed(value: usize) -> isize {
  isize::try_from(value).unwrap_or(isize::MAX)
}

fn diff_meta(from: &TextSection, to: &TextSection) -> MetaDiffs {
  let mut out = MetaDiffs::new();
  let kinds: std::collections::BTreeSet<MetaKind> =
    from.meta.keys().chain(to.meta.keys()).copied().collect();

  for kind in kinds {
    let before = from.meta(kind);
    let after = to.meta(kind);
    let mut deltas = Vec::new();
    let mut cascade: isize = 0;

    for index in 0..before.len().max(after.len()) {
      match (before.get(index), after.get(index)) {
        (Some(old), Some(new)) => {
          let position_delta = signed(new.position) - (signed(old.position) + cascade);
          let length_delta = signed(new.length) - signed(old.length);
          let data_delta = i64::from(new.data) - i64::from(old.data);
          if position_delta != 0 || length_delta != 0 || data_delta != 0 {
            deltas.push(MetaRangeDelta::Shift {
              index,
              position_delta,
              length_delta,
              data_delta,
            });
          }
          cascade += length_delta;
        },
        (Some(old), None) => deltas.push(MetaRangeDelta::Removed { index, range: *old }),
        (None, Some(new)) => deltas.push(MetaRangeDelta::Added { index, range: *new }),
        (None, None) => {},
      }
    }

    if !deltas.is_empty() {
      out.insert(kind, deltas);
    }
  }
  out
}

impl SectionDiff {
  /// True if applying the diff changes nothing.
  pub fn is_empty(&self) -> bool {
    match self {
      Self::Replace { from, to } => from == to,
      Self::Text(delta) => delta.parts.is_empty() && delta.meta.is_empty(),
    }
  }

  /// Produces the new snapshot from the old one.
  pub fn apply(&self, on: &Section) -> Result<Section> {
    self.run(on, Direction::Apply)
  }

  /// Produces the old snapshot from the new one.
  pub fn undo(&self, on: &Section) -> Result<Section> {
    self.run(on, Direction::Undo)
  }

  pub fn as_text(&self) -> Option<&TextDelta> {
    match self {
      Self::Text(delta) => Some(delta),
      Self::Replace { .. } => None,
    }
  }

  fn run(&self, on: &Section, direction: Direction) -> Result<Section> {
    match self {
      Self::Replace { from, to } => {
        let (expected, result) = match direction {
          Direction::Apply => (from, to),
          Direction::Undo => (to, from),
        };
        if on != expected {
          return Err(DiffError::SnapshotMismatch);
        }
        Ok(result.clone())
      },
      Self::Text(delta) => {
        let Section::Text(text) = on else {
          return Err(DiffError::NotText {
            found: on.kind_name(),
          });
        };
        delta.run(text, direction).map(Section::Text)
      },
    }
  }
}

impl TextDelta {
  pub fn apply(&self, on: &TextSection) -> Result<TextSection> {
    self.run(on, Direction::Apply)
  }

  pub fn undo(&self, on: &TextSection) -> Result<TextSection> {
    self.run(on, Direction::Undo)
  }

  /// Character ranges of inserted text, in the new text.
  pub fn inserted_ranges(&self) -> Vec<Range<usize>> {
    self.ranges(|part| &part.insert)
  }

  /// Character ranges of deleted text, in the old text.
  pub fn deleted_ranges(&self) -> Vec<Range<usize>> {
    self.ranges(|part| &part.delete)
  }

  fn ranges(&self, side: impl Fn(&TextPart) -> &String) -> Vec<Range<usize>> {
    let mut cursor = 0;
    let mut out = Vec::new();
    for part in &self.parts {
      let at = cursor + part.from_offset;
      let len = side(part).chars().count();
      if len > 0 {
        out.push(at..at + len);
      }
      cursor = at + len;
    }
    out
  }

  fn run(&self, on: &TextSection, direction: Direction) -> Result<TextSection> {
    let text = splice_parts(&on.text, &self.parts, direction)?;
    let mut meta = on.meta.clone();
    for (kind, deltas) in &self.meta {
      let ranges = meta.remove(kind).unwrap_or_default();
      let ranges = match direction {
        Direction::Apply => apply_meta(*kind, &ranges, deltas)?,
        Direction::Undo => undo_meta(*kind, &ranges, deltas)?,
      };
      if !ranges.is_empty() {
        meta.insert(*kind, ranges);
      }
    }
    Ok(TextSection { text, meta })
  }
}

fn splice_parts(text: &str, parts: &[TextPart], direction: Direction) -> Result<String> {
  let chars: Vec<char> = text.chars().collect();
  let mut out = String::with_capacity(text.len());
  let mut cursor = 0;

  for part in parts {
    let (remove, insert) = match direction {
      Direction::Apply => (&part.delete, &part.insert),
      Direction::Undo => (&part.insert, &part.delete),
    };
    let at = cursor + part.from_offset;
    let len = remove.chars().count();
    let end = at + len;
    if end > chars.len() {
      return Err(DiffError::PartOutOfBounds {
        at,
        len,
        text_len: chars.len(),
      });
    }
    let found: String = chars[at..end].iter().collect();
    if found != *remove {
      return Err(DiffError::TextMismatch {
        at,
        expected: remove.clone(),
        found,
      });
    }
    out.extend(&chars[cursor..at]);
    out.push_str(insert);
    cursor = end;
  }

  out.extend(&chars[cursor..]);
  Ok(out)
}

/// Position shift each range receives from length changes of earlier
/// ranges: an exclusive prefix sum of the `Shift` length deltas.
fn cascade(deltas: &[MetaRangeDelta], len: usize) -> Vec<isize> {
  let mut grown = vec![0isize; len + 1];
  for delta in deltas {
    if let MetaRangeDelta::Shift {
      index,
      length_delta,
      ..
    } = *delta
      && index < len
    {
      grown[index + 1] += length_delta;
    }
  }
  grown
    .iter()
    .scan(0isize, |sum, grown| {
      *sum += grown;
      Some(*sum)
    })
    .take(len)
    .collect()
}

fn shifts(deltas: &[MetaRangeDelta]) -> BTreeMap<usize, (isize, isize, i64)> {
  deltas
    .iter()
    .filter_map(|delta| match delta {
      MetaRangeDelta::Shift {
        index,
        position_delta,
        length_delta,
        data_delta,
      } => Some((*index, (*position_delta, *length_delta, *data_delta))),
      _ => None,
    })
    .collect()
}

fn move_range(
  kind: MetaKind,
  index: usize,
  range: MetaRange,
  position: isize,
  length: isize,
  data: i64,
) -> Result<MetaRange> {
  let overflow = || DiffError::MetaOverflow { kind, index };
  Ok(MetaRange {
    position: range.position.checked_add_signed(position).ok_or_else(overflow)?,
    length:   range.length.checked_add_signed(length).ok_or_else(overflow)?,
    data:     i32::try_from(i64::from(range.data) + data).map_err(|_| overflow())?,
  })
}

fn check_shifts(
  kind: MetaKind,
  shifts: &BTreeMap<usize, (isize, isize, i64)>,
  len: usize,
) -> Result<()> {
  match shifts.keys().next_back() {
    Some(&index) if index >= len => Err(DiffError::MetaOutOfBounds { kind, index, len }),
    _ => Ok(()),
  }
}

fn apply_meta(kind: MetaKind, ranges: &[MetaRange], deltas: &[MetaRangeDelta]) -> Result<Vec<MetaRange>> {
  let keep = deltas
    .iter()
    .filter_map(|delta| match delta {
      MetaRangeDelta::Removed { index, .. } => Some(*index),
      _ => None,
    })
    .min()
    .unwrap_or(ranges.len())
    .min(ranges.len());
  let shifts = shifts(deltas);
  check_shifts(kind, &shifts, ranges.len())?;
  let cascade = cascade(deltas, ranges.len());

  let mut out = ranges[..keep]
    .iter()
    .enumerate()
    .map(|(index, range)| {
      let (position, length, data) = shifts.get(&index).copied().unwrap_or_default();
      move_range(kind, index, *range, cascade[index] + position, length, data)
    })
    .collect::<Result<Vec<_>>>()?;

  out.extend(deltas.iter().filter_map(|delta| match delta {
    MetaRangeDelta::Added { range, .. } => Some(*range),
    _ => None,
  }));
  out.retain(|range| !range.is_empty());
  Ok(out)
}

fn undo_meta(kind: MetaKind, ranges: &[MetaRange], deltas: &[MetaRangeDelta]) -> Result<Vec<MetaRange>> {
  let keep = deltas
    .iter()
    .filter_map(|delta| match delta {
      MetaRangeDelta::Added { index, .. } => Some(*index),
      _ => None,
    })
    .min()
    .unwrap_or(ranges.len())
    .min(ranges.len());
  let shifts = shifts(deltas);
  check_shifts(kind, &shifts, keep)?;
  let cascade = cascade(deltas, keep);

  let mut out = ranges[..keep]
    .iter()
    .enumerate()
    .map(|(index, range)| {
      let (position, length, data) = shifts.get(&index).copied().unwrap_or_default();
      move_range(kind, index, *range, -(cascade[index] + position), -length, -data)
    })
    .collect::<Result<Vec<_>>>()?;

  out.extend(deltas.iter().filter_map(|delta| match delta {
    MetaRangeDelta::Removed { range, .. } => Some(*range),
    _ => None,
  }));
  out.retain(|range| !range.is_empty());
  Ok(out)
}

#[cfg(test)]
mod tests {
  use quickcheck::{
    Arbitrary,
    Gen,
  };

  use super::*;
  use crate::meta::normalize_ranges;

  fn text_with(text: &str, kind: MetaKind, ranges: Vec<MetaRange>) -> Section {
    Section::Text(TextSection::new(text).with_meta(kind, ranges))
  }

  fn assert_roundtrip(a: &Section, b: &Section) {
    let delta = diff(a, b);
    let applied = delta.apply(a).unwrap();
    assert_eq!(&applied, b);
    assert_eq!(&delta.undo(&applied).unwrap(), a);
  }

  #[test]
  fn appended_character() {
    let delta = diff(&Section::text("World"), &Section::text("World!"));
    let SectionDiff::Text(delta) = delta else {
      panic!("expected a text delta");
    };
    assert_eq!(delta.parts.as_slice(), &[TextPart {
      from_offset: 5,
      insert:      "!".into(),
      delete:      String::new(),
    }]);
    assert!(delta.meta.is_empty());
  }

  #[test]
  fn grown_range_is_one_shift() {
    let kind = MetaKind::new(1);
    let a = text_with("ab", kind, vec![MetaRange::new(0, 1, 5)]);
    let b = text_with("ab", kind, vec![MetaRange::new(0, 2, 5)]);
    let SectionDiff::Text(delta) = diff(&a, &b) else {
      panic!("expected a text delta");
    };
    assert!(delta.parts.is_empty());
    assert_eq!(delta.meta[&kind], vec![MetaRangeDelta::Shift {
      index:          0,
      position_delta: 0,
      length_delta:   1,
      data_delta:     0,
    }]);
    assert_roundtrip(&a, &b);
  }

  #[test]
  fn length_change_does_not_cascade_into_false_deltas() {
    let kind = MetaKind::ORIGIN;
    let a = text_with("aaabbb", kind, vec![MetaRange::new(0, 3, 1), MetaRange::new(3, 3, 2)]);
    let b = text_with("aaaaabbb", kind, vec![
      MetaRange::new(0, 5, 1),
      MetaRange::new(5, 3, 2),
    ]);
    let SectionDiff::Text(delta) = diff(&a, &b) else {
      panic!("expected a text delta");
    };
    assert_eq!(delta.meta[&kind].len(), 1);
    assert_roundtrip(&a, &b);
  }

  #[test]
  fn removed_tail_is_restored_on_undo() {
    let kind = MetaKind::FORMATTING;
    let a = text_with("abcdef", kind, vec![
      MetaRange::new(0, 2, 1),
      MetaRange::new(2, 2, 2),
      MetaRange::new(4, 2, 3),
    ]);
    let b = text_with("abcdef", kind, vec![MetaRange::new(0, 2, 1)]);
    let SectionDiff::Text(delta) = diff(&a, &b) else {
      panic!("expected a text delta");
    };
    assert_eq!(delta.meta[&kind], vec![
      MetaRangeDelta::Removed {
        index: 1,
        range: MetaRange::new(2, 2, 2),
      },
      MetaRangeDelta::Removed {
        index: 2,
        range: MetaRange::new(4, 2, 3),
      },
    ]);
    assert_roundtrip(&a, &b);
    // undo after redo after undo
    let SectionDiff::Text(delta) = diff(&a, &b) else {
      unreachable!()
    };
    let once = delta.undo(&delta.apply(&a.as_text().cloned().unwrap()).unwrap()).unwrap();
    let twice = delta.undo(&delta.apply(&once).unwrap()).unwrap();
    assert_eq!(Section::Text(twice), a);
  }

  #[test]
  fn kind_present_on_one_side_only() {
    let kind = MetaKind::FORMATTING;
    let plain = Section::text("abc");
    let marked = text_with("abc", kind, vec![MetaRange::new(1, 1, 4)]);
    assert_roundtrip(&plain, &marked);
    assert_roundtrip(&marked, &plain);
  }

  #[test]
  fn variant_change_is_replace() {
    let delta = diff(&Section::text("abc"), &Section::Image);
    assert!(matches!(delta, SectionDiff::Replace { .. }));
    assert_eq!(delta.apply(&Section::text("abc")).unwrap(), Section::Image);
    assert_eq!(delta.undo(&Section::Image).unwrap(), Section::text("abc"));
    assert_eq!(
      delta.apply(&Section::Empty),
      Err(DiffError::SnapshotMismatch)
    );
  }

  #[test]
  fn equal_sections_have_empty_diff() {
    let a = text_with("same", MetaKind::ORIGIN, vec![MetaRange::new(0, 4, 1)]);
    assert!(diff(&a, &a.clone()).is_empty());
    assert!(diff(&Section::Empty, &Section::Empty).is_empty());
  }

  #[test]
  fn text_delta_rejects_other_sections() {
    let delta = diff(&Section::text("a"), &Section::text("b"));
    assert_eq!(delta.apply(&Section::Image), Err(DiffError::NotText {
      found: "image",
    }));
  }

  #[test]
  fn mismatched_text_is_rejected() {
    let delta = diff(&Section::text("cat"), &Section::text("cut"));
    assert!(matches!(
      delta.apply(&Section::text("cot")),
      Err(DiffError::TextMismatch { .. })
    ));
    assert!(matches!(
      delta.apply(&Section::text("")),
      Err(DiffError::PartOutOfBounds { .. })
    ));
  }

  #[test]
  fn changed_ranges_point_into_each_side() {
    // "the cat sat" -> "the tiger sat down"
    let delta = TextDelta {
      parts: SmallVec::from_vec(vec![
        TextPart {
          from_offset: 4,
          insert:      "tiger".into(),
          delete:      "cat".into(),
        },
        TextPart {
          from_offset: 4,
          insert:      " down".into(),
          delete:      String::new(),
        },
      ]),
      meta:  MetaDiffs::new(),
    };
    assert_eq!(delta.deleted_ranges(), vec![4..7]);
    assert_eq!(delta.inserted_ranges(), vec![4..9, 13..18]);
    let before = TextSection::new("the cat sat");
    assert_eq!(delta.apply(&before).unwrap().text, "the tiger sat down");
  }

  #[test]
  fn serializes_as_plain_data() {
    let a = text_with("ab", MetaKind::ORIGIN, vec![MetaRange::new(0, 1, 5)]);
    let b = text_with("abc", MetaKind::ORIGIN, vec![MetaRange::new(0, 3, 5)]);
    let delta = diff(&a, &b);
    let json = serde_json::to_string(&delta).unwrap();
    let back: SectionDiff = serde_json::from_str(&json).unwrap();
    assert_eq!(back, delta);
  }

  #[derive(Debug, Clone)]
  struct ArbitrarySection(Section);

  impl Arbitrary for ArbitrarySection {
    fn arbitrary(g: &mut Gen) -> Self {
      let alphabet = ['a', 'b', 'c', ' ', 'é', '\u{1F600}'];
      let len = usize::arbitrary(g) % 12;
      let text: String = (0..len).map(|_| *g.choose(&alphabet).unwrap()).collect();
      let mut section = TextSection::new(text);
      for kind in [MetaKind::ORIGIN, MetaKind::FORMATTING] {
        let mut position = 0;
        let mut ranges = Vec::new();
        while position < len && bool::arbitrary(g) {
          let length = 1 + usize::arbitrary(g) % (len - position);
          ranges.push(MetaRange::new(position, length, i32::from(u8::arbitrary(g) % 3)));
          position += length + usize::arbitrary(g) % 2;
        }
        section.set_meta(kind, normalize_ranges(ranges));
      }
      Self(Section::Text(section))
    }
  }

  quickcheck::quickcheck! {
    fn diff_roundtrip(a: ArbitrarySection, b: ArbitrarySection) -> bool {
      let (a, b) = (a.0, b.0);
      let delta = diff(&a, &b);
      match delta.apply(&a) {
        Ok(applied) => applied == b && delta.undo(&applied).as_ref() == Ok(&a),
        Err(_) => false,
      }
    }
  }
}
