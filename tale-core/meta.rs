//! Classified spans over section text.
//!
//! A section carries, per [`MetaKind`], an ordered list of [`MetaRange`]s.
//! Ranges of one kind never overlap, never have zero length, and two
//! contiguous ranges never share the same `data` value: they are merged
//! into one. [`normalize_ranges`] restores that shape after any edit.

use std::fmt;

use serde::{
  Deserialize,
  Serialize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaKind(u32);

impl MetaKind {
  /// Who produced the text (see [`Origin`]).
  pub const ORIGIN: Self = Self(1);
  /// Inline formatting flags.
  pub const FORMATTING: Self = Self(2);

  pub const fn new(kind: u32) -> Self {
    Self(kind)
  }

  pub const fn get(self) -> u32 {
    self.0
  }
}

impl fmt::Display for MetaKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Self::ORIGIN => f.write_str("origin"),
      Self::FORMATTING => f.write_str("formatting"),
      Self(other) => write!(f, "meta:{other}"),
    }
  }
}

/// Half-open span `[position, position + length)` in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaRange {
  pub position: usize,
  pub length:   usize,
  pub data:     i32,
}

impl MetaRange {
  pub const fn new(position: usize, length: usize, data: i32) -> Self {
    Self {
      position,
      length,
      data,
    }
  }

  #[inline]
  pub const fn end(&self) -> usize {
    self.position + self.length
  }

  #[inline]
  pub const fn is_empty(&self) -> bool {
    self.length == 0
  }
}

/// Origin classification stored as `data` under [`MetaKind::ORIGIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Origin {
  Ai     = 1,
  Edit   = 2,
  User   = 3,
  Prompt = 4,
}

impl Origin {
  pub const fn data(self) -> i32 {
    self as i32
  }

  pub const fn from_data(data: i32) -> Option<Self> {
    match data {
      1 => Some(Self::Ai),
      2 => Some(Self::Edit),
      3 => Some(Self::User),
      4 => Some(Self::Prompt),
      _ => None,
    }
  }
}

/// Drops zero-length ranges and merges contiguous ranges with equal data.
///
/// Order is preserved; ranges are not sorted.
pub fn normalize_ranges<I>(ranges: I) -> Vec<MetaRange>
where
  I: IntoIterator<Item = MetaRange>,
{
  let mut out: Vec<MetaRange> = Vec::new();
  for range in ranges {
    if range.is_empty() {
      continue;
    }
    match out.last_mut() {
      Some(prev) if prev.data == range.data && prev.end() == range.position => {
        prev.length += range.length;
      },
      _ => out.push(range),
    }
  }
  out
}

/// True if `ranges` is already in normalized form.
pub fn is_normalized(ranges: &[MetaRange]) -> bool {
  ranges.iter().all(|range| !range.is_empty())
    && ranges
      .windows(2)
      .all(|pair| !(pair[0].data == pair[1].data && pair[0].end() == pair[1].position))
}

/// The part of `ranges` inside `[start, end)`, rebased so `start` becomes 0.
pub fn slice_ranges(ranges: &[MetaRange], start: usize, end: usize) -> Vec<MetaRange> {
  if end <= start {
    return Vec::new();
  }
  normalize_ranges(ranges.iter().filter_map(|range| {
    let from = range.position.max(start);
    let until = range.end().min(end);
    (until > from).then(|| MetaRange::new(from - start, until - from, range.data))
  }))
}

/// Moves every range `by` characters to the right.
pub fn offset_ranges(ranges: &[MetaRange], by: usize) -> impl Iterator<Item = MetaRange> + '_ {
  ranges
    .iter()
    .map(move |range| MetaRange::new(range.position + by, range.length, range.data))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalize_merges_contiguous_equal_data() {
    let ranges = vec![
      MetaRange::new(0, 2, 1),
      MetaRange::new(2, 3, 1),
      MetaRange::new(5, 1, 2),
      MetaRange::new(6, 0, 2),
      MetaRange::new(6, 4, 2),
    ];
    assert_eq!(normalize_ranges(ranges), vec![
      MetaRange::new(0, 5, 1),
      MetaRange::new(5, 5, 2),
    ]);
  }

  #[test]
  fn normalize_keeps_gaps() {
    let ranges = vec![MetaRange::new(0, 2, 1), MetaRange::new(3, 2, 1)];
    assert_eq!(normalize_ranges(ranges.clone()), ranges);
  }

  #[test]
  fn slice_clips_and_rebases() {
    let ranges = vec![
      MetaRange::new(0, 4, 1),
      MetaRange::new(4, 4, 2),
      MetaRange::new(8, 2, 3),
    ];
    assert_eq!(slice_ranges(&ranges, 2, 6), vec![
      MetaRange::new(0, 2, 1),
      MetaRange::new(2, 2, 2),
    ]);
    assert!(slice_ranges(&ranges, 6, 6).is_empty());
  }

  #[test]
  fn origin_roundtrips_through_data() {
    for origin in [Origin::Ai, Origin::Edit, Origin::User, Origin::Prompt] {
      assert_eq!(Origin::from_data(origin.data()), Some(origin));
    }
    assert_eq!(Origin::from_data(0), None);
  }

  quickcheck::quickcheck! {
    fn normalized_output_is_normalized(raw: Vec<(u8, u8, i8)>) -> bool {
      let mut position = 0usize;
      let ranges: Vec<MetaRange> = raw
        .into_iter()
        .map(|(gap, length, data)| {
          position += (gap % 3) as usize;
          let range = MetaRange::new(position, (length % 5) as usize, (data % 3) as i32);
          position = range.end();
          range
        })
        .collect();
      is_normalized(&normalize_ranges(ranges))
    }
  }
}
