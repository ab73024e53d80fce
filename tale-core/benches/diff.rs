//! Benchmarks for section diffing.
//!
//! Run with: `cargo bench -p tale-core --bench diff`

use divan::{
  Bencher,
  black_box,
};
use tale_core::{
  MetaKind,
  MetaRange,
  Section,
  TextSection,
  diff::diff,
};

fn main() {
  divan::main();
}

fn make_text(size: usize) -> String {
  let line = "The quick brown fox jumps over the lazy dog. ";
  let mut s = String::with_capacity(size);
  while s.len() < size {
    s.push_str(line);
  }
  s.truncate(size);
  s
}

fn make_section(size: usize) -> TextSection {
  let text = make_text(size);
  let ranges = (0..size / 16)
    .map(|i| MetaRange::new(i * 16, 16, (i % 3) as i32))
    .collect();
  TextSection::new(text).with_meta(MetaKind::ORIGIN, ranges)
}

/// Rewrites every `every`th word.
fn edit_words(section: &TextSection, every: usize) -> TextSection {
  let text = section
    .text
    .split(' ')
    .enumerate()
    .map(|(i, word)| if i % every == 0 { "WORD" } else { word })
    .collect::<Vec<_>>()
    .join(" ");
  let len = text.chars().count();
  let ranges = (0..len / 16)
    .map(|i| MetaRange::new(i * 16, 16, (i % 3) as i32))
    .collect();
  TextSection::new(text).with_meta(MetaKind::ORIGIN, ranges)
}

#[divan::bench(args = [64, 1024, 16 * 1024])]
fn append(bencher: Bencher, size: usize) {
  let before = make_section(size);
  let mut after = before.clone();
  after.text.push_str(" and then some.");
  let (before, after) = (Section::Text(before), Section::Text(after));
  bencher.bench(|| diff(black_box(&before), black_box(&after)));
}

#[divan::bench(args = [64, 1024, 16 * 1024])]
fn scattered_rewrites(bencher: Bencher, size: usize) {
  let before = make_section(size);
  let after = edit_words(&before, 7);
  let (before, after) = (Section::Text(before), Section::Text(after));
  bencher.bench(|| diff(black_box(&before), black_box(&after)));
}

#[divan::bench(args = [64, 1024, 16 * 1024])]
fn apply_and_undo(bencher: Bencher, size: usize) {
  let before = Section::Text(make_section(size));
  let after = Section::Text(edit_words(before.as_text().unwrap(), 5));
  let delta = diff(&before, &after);
  bencher.bench(|| {
    let applied = delta.apply(black_box(&before)).unwrap();
    delta.undo(&applied).unwrap()
  });
}
