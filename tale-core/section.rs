//! The unit of story content.
//!
//! Sections are value snapshots: every edit produces a new [`Section`] that
//! replaces the stored one for an id. All offsets are in characters.

use std::collections::BTreeMap;

use serde::{
  Deserialize,
  Serialize,
};

use crate::meta::{
  MetaKind,
  MetaRange,
  is_normalized,
  normalize_ranges,
  offset_ranges,
  slice_ranges,
};

pub type MetaMap = BTreeMap<MetaKind, Vec<MetaRange>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
  Empty,
  Text(TextSection),
  /// Placeholder; images carry no diffable content.
  Image,
}

impl Section {
  pub fn text(text: impl Into<String>) -> Self {
    Self::Text(TextSection::new(text))
  }

  pub fn as_text(&self) -> Option<&TextSection> {
    match self {
      Self::Text(text) => Some(text),
      _ => None,
    }
  }

  /// Plain text content, empty for non-text sections.
  pub fn plain_text(&self) -> &str {
    match self {
      Self::Text(text) => &text.text,
      Self::Empty | Self::Image => "",
    }
  }

  /// Length in characters of [`Section::plain_text`].
  pub fn len_chars(&self) -> usize {
    self.plain_text().chars().count()
  }

  /// See [`TextSection::normalize`]. Non-text sections are left alone.
  pub fn normalize(&mut self) {
    if let Self::Text(text) = self {
      text.normalize();
    }
  }

  pub fn is_normalized(&self) -> bool {
    self.as_text().is_none_or(TextSection::is_normalized)
  }

  pub const fn kind_name(&self) -> &'static str {
    match self {
      Self::Empty => "empty",
      Self::Text(_) => "text",
      Self::Image => "image",
    }
  }
}

impl From<TextSection> for Section {
  fn from(value: TextSection) -> Self {
    Self::Text(value)
  }
}

#[derive(Debug, Clone, Default, Eq, Serialize, Deserialize)]
pub struct TextSection {
  pub text: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub meta: MetaMap,
}

/// Missing kinds and kinds with no ranges compare equal.
impl PartialEq for TextSection {
  fn eq(&self, other: &Self) -> bool {
    if self.text != other.text {
      return false;
    }
    let non_empty = |meta: &MetaMap| {
      meta
        .iter()
        .filter(|(_, ranges)| !ranges.is_empty())
        .map(|(kind, ranges)| (*kind, ranges.clone()))
        .collect::<Vec<_>>()
    };
    non_empty(&self.meta) == non_empty(&other.meta)
  }
}

impl TextSection {
  pub fn new(text: impl Into<String>) -> Self {
    Self {
      text: text.into(),
      meta: MetaMap::new(),
    }
  }

  /// Text entirely covered by one range of `kind`.
  pub fn tagged(text: impl Into<String>, kind: MetaKind, data: i32) -> Self {
    let text = text.into();
    let len = text.chars().count();
    Self::new(text).with_meta(kind, vec![MetaRange::new(0, len, data)])
  }

  pub fn with_meta(mut self, kind: MetaKind, ranges: Vec<MetaRange>) -> Self {
    self.set_meta(kind, ranges);
    self
  }

  pub fn len_chars(&self) -> usize {
    self.text.chars().count()
  }

  pub fn is_empty(&self) -> bool {
    self.text.is_empty()
  }

  pub fn meta(&self, kind: MetaKind) -> &[MetaRange] {
    self.meta.get(&kind).map(Vec::as_slice).unwrap_or(&[])
  }

  /// Replaces the ranges of `kind`, normalizing them.
  pub fn set_meta(&mut self, kind: MetaKind, ranges: Vec<MetaRange>) {
    let ranges = normalize_ranges(ranges);
    if ranges.is_empty() {
      self.meta.remove(&kind);
    } else {
      self.meta.insert(kind, ranges);
    }
  }

  /// Restores the range invariants of every kind after `meta` was written
  /// directly: zero-length ranges go, contiguous equal ranges merge.
  pub fn normalize(&mut self) {
    for (kind, ranges) in std::mem::take(&mut self.meta) {
      self.set_meta(kind, ranges);
    }
  }

  pub fn is_normalized(&self) -> bool {
    self.meta.values().all(|ranges| is_normalized(ranges))
  }

  /// Characters `[start, end)` with their metadata. Bounds are clamped.
  pub fn slice(&self, start: usize, end: usize) -> Self {
    let len = self.len_chars();
    let end = end.min(len);
    let start = start.min(end);
    let text: String = self.text.chars().skip(start).take(end - start).collect();
    let mut out = Self::new(text);
    for (kind, ranges) in &self.meta {
      out.set_meta(*kind, slice_ranges(ranges, start, end));
    }
    out
  }

  /// `self` followed by `other`; ranges meeting at the seam are merged.
  pub fn concat(&self, other: &Self) -> Self {
    let shift = self.len_chars();
    let mut out = Self::new(format!("{}{}", self.text, other.text));
    let kinds = self.meta.keys().chain(other.meta.keys());
    for kind in kinds {
      if out.meta.contains_key(kind) {
        continue;
      }
      let ranges = self
        .meta(*kind)
        .iter()
        .copied()
        .chain(offset_ranges(other.meta(*kind), shift))
        .collect();
      out.set_meta(*kind, ranges);
    }
    out
  }

  /// Replaces `delete` characters at `at` with `insert`.
  pub fn splice(&self, at: usize, delete: usize, insert: &Self) -> Self {
    let len = self.len_chars();
    let at = at.min(len);
    let resume = at.saturating_add(delete).min(len);
    self
      .slice(0, at)
      .concat(insert)
      .concat(&self.slice(resume, len))
  }

  /// Splits on `\n`, dropping the separators. Always yields at least one line.
  pub fn split_lines(&self) -> Vec<Self> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (index, ch) in self.text.chars().enumerate() {
      if ch == '\n' {
        lines.push(self.slice(start, index));
        start = index + 1;
      }
    }
    lines.push(self.slice(start, usize::MAX));
    lines
  }
}

/// One metadata-free section per `\n`-separated line.
pub fn sections_from_text(text: &str) -> Vec<TextSection> {
  text.split('\n').map(TextSection::new).collect()
}

pub fn clone_section(section: &Section) -> Section {
  section.clone()
}

pub fn sections_equal(a: &Section, b: &Section) -> bool {
  a == b
}
