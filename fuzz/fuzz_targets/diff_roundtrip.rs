#![no_main]

mod common;

use libfuzzer_sys::fuzz_target;
use tale_core::{
  DiffOptions,
  Section,
  diff::diff_with,
};

use crate::common::ByteCursor;

fuzz_target!(|data: &[u8]| {
  let mut cursor = ByteCursor::new(data);
  let from = Section::Text(cursor.next_section());
  let to = Section::Text(cursor.next_section());
  let options = DiffOptions {
    edit_cost:      cursor.next_usize(8),
    max_diff_chars: cursor.next_usize(1024),
  };

  let diff = diff_with(&from, &to, &options);
  let applied = diff.apply(&from).expect("diff does not apply to its source");
  assert_eq!(applied, to);
  let undone = diff.undo(&applied).expect("diff does not undo its target");
  assert_eq!(undone, from);
});
