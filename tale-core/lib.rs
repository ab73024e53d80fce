//! Section model and diff engine for story documents.
//!
//! - [`section`]: the content unit and its value operations.
//! - [`meta`]: classified ranges over section text.
//! - [`diff`]: invertible section diffs.
//! - [`id`]: section ids and their allocation.

pub mod diff;
pub mod id;
pub mod meta;
pub mod section;
pub mod text_diff;

pub use crate::{
  diff::{
    DiffOptions,
    SectionDiff,
  },
  id::SectionId,
  meta::{
    MetaKind,
    MetaRange,
  },
  section::{
    Section,
    TextSection,
  },
};
