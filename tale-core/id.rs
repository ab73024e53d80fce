//! Section identifiers and their allocation.

use std::{
  collections::HashSet,
  fmt,
  num::NonZeroU64,
};

use serde::{
  Deserialize,
  Serialize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionId(NonZeroU64);

impl SectionId {
  pub const fn new(id: NonZeroU64) -> Self {
    Self(id)
  }

  pub const fn get(self) -> NonZeroU64 {
    self.0
  }

  /// Builds an id from a raw integer, `None` for zero.
  pub fn from_raw(raw: u64) -> Option<Self> {
    NonZeroU64::new(raw).map(Self)
  }
}

impl From<NonZeroU64> for SectionId {
  fn from(value: NonZeroU64) -> Self {
    Self::new(value)
  }
}

impl fmt::Display for SectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Hands out section ids that are unique for the lifetime of the allocator.
///
/// Every id that has been handed out, or that was loaded from existing data
/// through [`IdAllocator::reserve`], is remembered. Allocation walks a
/// counter forward and retries until it lands on an id nobody holds, so
/// reserving ids out of order never produces a collision.
#[derive(Debug, Clone)]
pub struct IdAllocator {
  next:     NonZeroU64,
  reserved: HashSet<SectionId>,
}

impl Default for IdAllocator {
  fn default() -> Self {
    Self::new()
  }
}

impl IdAllocator {
  pub fn new() -> Self {
    Self::starting_at(NonZeroU64::MIN)
  }

  pub fn starting_at(next: NonZeroU64) -> Self {
    Self {
      next,
      reserved: HashSet::new(),
    }
  }

  /// Marks `id` as taken. Returns false if it already was.
  pub fn reserve(&mut self, id: SectionId) -> bool {
    self.reserved.insert(id)
  }

  pub fn is_reserved(&self, id: SectionId) -> bool {
    self.reserved.contains(&id)
  }

  pub fn allocate(&mut self) -> SectionId {
    loop {
      let candidate = SectionId::new(self.next);
      // Wrap back to 1 instead of overflowing; reserved ids are skipped anyway.
      self.next = self.next.checked_add(1).unwrap_or(NonZeroU64::MIN);
      if self.reserved.insert(candidate) {
        return candidate;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn id(raw: u64) -> SectionId {
    SectionId::from_raw(raw).unwrap()
  }

  #[test]
  fn allocates_sequentially() {
    let mut ids = IdAllocator::new();
    assert_eq!(ids.allocate(), id(1));
    assert_eq!(ids.allocate(), id(2));
    assert_eq!(ids.allocate(), id(3));
  }

  #[test]
  fn skips_reserved_ids() {
    let mut ids = IdAllocator::new();
    assert!(ids.reserve(id(2)));
    assert!(ids.reserve(id(3)));
    assert!(!ids.reserve(id(3)));

    assert_eq!(ids.allocate(), id(1));
    assert_eq!(ids.allocate(), id(4));
  }

  #[test]
  fn wraps_around_at_max() {
    let mut ids = IdAllocator::starting_at(NonZeroU64::MAX);
    ids.reserve(id(1));
    assert_eq!(ids.allocate().get(), NonZeroU64::MAX);
    assert_eq!(ids.allocate(), id(2));
  }

  #[test]
  fn zero_is_not_an_id() {
    assert!(SectionId::from_raw(0).is_none());
    assert_eq!(id(7).to_string(), "#7");
  }
}
