#![no_main]

mod common;

use std::collections::HashMap;

use libfuzzer_sys::fuzz_target;
use tale_core::Section;
use tale_lib::Document;

use crate::common::{
  apply_op,
  decode_ops,
};

fuzz_target!(|data: &[u8]| {
  let (initial, ops) = decode_ops(data);
  let Ok(mut doc) = Document::from_sections(initial.into_iter().map(Section::Text)) else {
    return;
  };

  // every node must always come back with the same sections
  let mut seen = HashMap::new();
  seen.insert(doc.current_history_node(), doc.section_list().clone());

  for op in &ops {
    let committed_from = doc.current_history_node();
    if let Some(node) = apply_op(&mut doc, op) {
      let expected = seen.entry(node).or_insert_with(|| doc.section_list().clone());
      assert_eq!(expected, doc.section_list());
    } else if doc.current_history_node() != committed_from {
      seen.insert(doc.current_history_node(), doc.section_list().clone());
    }
  }

  let reloaded = parts_roundtrip(&doc);
  assert_eq!(reloaded.section_list(), doc.section_list());
});

fn parts_roundtrip(doc: &Document) -> Document {
  let parts = tale_lib::document::DocumentParts::from(doc.clone());
  Document::from_parts(parts).expect("document did not survive a round trip")
}
