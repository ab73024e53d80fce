//! Import of stories stored in the old block format.
//!
//! A legacy story is a tree of blocks. Each block replaces the characters
//! `[startIndex, endIndex)` of the text its parent left behind with a
//! fragment of a given origin. Siblings are alternative continuations; the
//! story's `currentBlock` marks the one the reader was looking at.
//!
//! Conversion walks the tree depth first, turning every block into a
//! history node and every fork into a branch of the [`HistoryTree`]. A
//! block flagged `chain` that is its parent's only child belongs to the
//! same logical edit and shares the parent's node.
//!
//! [`HistoryTree`]: crate::history::HistoryTree

use std::collections::HashMap;

use serde::{
  Deserialize,
  Serialize,
};
use tale_core::{
  DiffOptions,
  MetaKind,
  Section,
  SectionId,
  TextSection,
  diff::diff_with,
  meta::Origin,
};
use thiserror::Error;

use crate::{
  change::{
    ChangeMap,
    HistoryStep,
  },
  config::{
    Config,
    LegacyOptions,
  },
  document::{
    Document,
    DocumentError,
  },
  history::HistoryNodeId,
};

pub type Result<T> = std::result::Result<T, LegacyError>;

#[derive(Debug, Error)]
pub enum LegacyError {
  #[error("invalid legacy story: {0}")]
  Json(#[from] serde_json::Error),
  #[error("legacy story has no root block")]
  MissingRoot,
  #[error("legacy story has two root blocks, {0} and {1}")]
  MultipleRoots(usize, usize),
  #[error("block {from} links to block {to}, which does not exist")]
  DanglingLink { from: usize, to: i64 },
  #[error("block {child} does not point back to its parent {parent}")]
  BrokenLink { parent: usize, child: usize },
  #[error("block {0} is reached twice")]
  Cycle(usize),
  #[error("current block {0} does not exist")]
  MissingCurrent(i64),
  #[error(transparent)]
  Document(#[from] DocumentError),
}

/// Parent index of a root block.
pub const NO_BLOCK: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyStory {
  pub blocks:        Vec<LegacyBlock>,
  pub current_block: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyBlock {
  pub prev_block:    i64,
  #[serde(default)]
  pub next_block:    Vec<i64>,
  pub start_index:   usize,
  pub end_index:     usize,
  pub data_fragment: DataFragment,
  #[serde(default)]
  pub chain:         bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFragment {
  pub data:   String,
  pub origin: LegacyOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyOrigin {
  Root,
  Prompt,
  User,
  Edit,
  Ai,
}

impl From<LegacyOrigin> for Origin {
  fn from(origin: LegacyOrigin) -> Self {
    match origin {
      LegacyOrigin::Root | LegacyOrigin::Prompt => Origin::Prompt,
      LegacyOrigin::User => Origin::User,
      LegacyOrigin::Edit => Origin::Edit,
      LegacyOrigin::Ai => Origin::Ai,
    }
  }
}

impl LegacyStory {
  pub fn from_json(json: &str) -> Result<Self> {
    Ok(serde_json::from_str(json)?)
  }

  fn block(&self, index: i64) -> Option<&LegacyBlock> {
    usize::try_from(index).ok().and_then(|index| self.blocks.get(index))
  }

  /// Finds the root and checks that parent and child links agree.
  fn validate(&self) -> Result<usize> {
    let mut root = None;
    for (index, block) in self.blocks.iter().enumerate() {
      if block.prev_block == NO_BLOCK {
        if let Some(first) = root {
          return Err(LegacyError::MultipleRoots(first, index));
        }
        root = Some(index);
      } else if self.block(block.prev_block).is_none() {
        return Err(LegacyError::DanglingLink {
          from: index,
          to:   block.prev_block,
        });
      }

      for &next in &block.next_block {
        let child = self.block(next).ok_or(LegacyError::DanglingLink {
          from: index,
          to:   next,
        })?;
        if child.prev_block != index as i64 {
          return Err(LegacyError::BrokenLink {
            parent: index,
            child:  next as usize,
          });
        }
      }
    }
    if self.block(self.current_block).is_none() {
      return Err(LegacyError::MissingCurrent(self.current_block));
    }
    root.ok_or(LegacyError::MissingRoot)
  }
}

enum Frame {
  Enter(usize),
  /// Return to a fork once one of its branches is done.
  Rewind(HistoryNodeId),
}

/// Replays legacy stories into [`Document`]s.
#[derive(Debug, Clone, Default)]
pub struct LegacyConverter {
  options: LegacyOptions,
  diff:    DiffOptions,
}

impl LegacyConverter {
  pub fn new(config: &Config) -> Self {
    Self {
      options: config.legacy.clone(),
      diff:    config.diff.clone(),
    }
  }

  pub fn convert_json(&self, json: &str) -> Result<Document> {
    self.convert(&LegacyStory::from_json(json)?)
  }

  pub fn convert(&self, story: &LegacyStory) -> Result<Document> {
    let root = story.validate()?;
    let mut doc = Document::with_options(self.diff.clone());
    let mut visited = vec![false; story.blocks.len()];
    let mut pending = Vec::new();
    let mut nodes: HashMap<usize, HistoryNodeId> = HashMap::new();
    let mut stack = vec![Frame::Enter(root)];

    while let Some(frame) = stack.pop() {
      match frame {
        Frame::Enter(index) => {
          if std::mem::replace(&mut visited[index], true) {
            return Err(LegacyError::Cycle(index));
          }
          let block = &story.blocks[index];
          let changes = self.splice(&mut doc, block)?;
          doc.push_change(changes)?;
          pending.push(index);

          let children: Vec<usize> = block.next_block.iter().map(|&next| next as usize).collect();
          let chained = self.options.merge_chains
            && matches!(children.as_slice(), [only] if story.blocks[*only].chain);
          if chained {
            stack.push(Frame::Enter(children[0]));
            continue;
          }

          doc.push_history();
          let node = doc.current_history_node();
          for block in pending.drain(..) {
            nodes.insert(block, node);
          }
          for &child in children.iter().rev() {
            stack.push(Frame::Rewind(node));
            stack.push(Frame::Enter(child));
          }
        },
        Frame::Rewind(fork) => {
          doc.push_history();
          while doc.current_history_node() != fork {
            if doc.pop_history()?.is_none() {
              break;
            }
          }
        },
      }
    }

    let skipped = visited.iter().filter(|seen| !**seen).count();
    if skipped > 0 {
      tracing::warn!(skipped, "legacy blocks unreachable from the root were skipped");
    }

    let current = story.current_block as usize;
    match nodes.get(&current) {
      Some(&node) => {
        doc.jump_to_history(node)?;
      },
      None => tracing::warn!(current, "current legacy block was not converted"),
    }
    Ok(doc)
  }

  /// Changes that replace the block's range of the current text with its
  /// fragment, splitting lines into sections.
  fn splice(&self, doc: &mut Document, block: &LegacyBlock) -> Result<ChangeMap> {
    let origin = Origin::from(block.data_fragment.origin);
    let fragment = TextSection::tagged(block.data_fragment.data.as_str(), MetaKind::ORIGIN, origin.data());

    let len = doc.section_list().len_chars();
    let mut end = block.end_index;
    if end > len {
      tracing::warn!(end, len, "legacy block ends past the text, clamping");
      end = len;
    }
    let mut start = block.start_index;
    if start > end {
      tracing::warn!(start, end, "legacy block starts past its end, clamping");
      start = end;
    }

    let mut changes = ChangeMap::new();
    let (Some((first, first_offset)), Some((last, last_offset))) = (
      doc.section_for_character_position(start),
      doc.section_for_character_position(end),
    ) else {
      let mut after = None;
      for line in fragment.split_lines() {
        let id = doc.allocate_section_id();
        changes.insert(id, HistoryStep::Create {
          section: line.into(),
          after,
        });
        after = Some(id);
      }
      return Ok(changes);
    };

    let as_text = |id: SectionId| match doc.section(id) {
      Some(Section::Text(text)) => text.clone(),
      _ => TextSection::default(),
    };
    let head = as_text(first);
    let tail = as_text(last);
    let merged = head
      .slice(0, first_offset)
      .concat(&fragment)
      .concat(&tail.slice(last_offset, usize::MAX));
    let mut lines = merged.split_lines().into_iter();

    if let Some(line) = lines.next() {
      let old = doc.section(first).cloned().unwrap_or(Section::Empty);
      let diff = diff_with(&old, &Section::Text(line), &self.diff);
      if !diff.is_empty() {
        changes.insert(first, HistoryStep::Update { diff });
      }
    }

    let list = doc.section_list();
    let (from, to) = (list.position(first), list.position(last));
    if let (Some(from), Some(to)) = (from, to) {
      let removed: Vec<(SectionId, Section)> = list.entries()[from + 1..=to].to_vec();
      for (id, previous) in removed {
        changes.insert(id, HistoryStep::Remove {
          previous,
          after: Some(first),
        });
      }
    }

    let mut after = first;
    for line in lines {
      let id = doc.allocate_section_id();
      changes.insert(id, HistoryStep::Create {
        section: line.into(),
        after:   Some(after),
      });
      after = id;
    }
    Ok(changes)
  }
}

#[cfg(test)]
mod tests {
  use tale_core::MetaRange;

  use super::*;

  fn block(prev: i64, next: &[i64], range: (usize, usize), data: &str, origin: LegacyOrigin) -> LegacyBlock {
    LegacyBlock {
      prev_block:    prev,
      next_block:    next.to_vec(),
      start_index:   range.0,
      end_index:     range.1,
      data_fragment: DataFragment {
        data: data.into(),
        origin,
      },
      chain:         false,
    }
  }

  fn chained(mut block: LegacyBlock) -> LegacyBlock {
    block.chain = true;
    block
  }

  fn converter() -> LegacyConverter {
    LegacyConverter::new(&Config::default())
  }

  fn branch_points(doc: &Document) -> usize {
    doc
      .history()
      .nodes()
      .filter(|node| node.children().len() > 1)
      .count()
  }

  #[test]
  fn fork_becomes_history_branch() {
    let story = LegacyStory {
      blocks:        vec![
        block(NO_BLOCK, &[1, 2], (0, 0), "Once upon a time", LegacyOrigin::Root),
        block(0, &[], (16, 16), " there was a cat", LegacyOrigin::Ai),
        block(0, &[], (16, 16), " there was a dog", LegacyOrigin::Ai),
      ],
      current_block: 1,
    };
    let doc = converter().convert(&story).unwrap();

    assert_eq!(doc.text(), "Once upon a time there was a cat");
    assert_eq!(branch_points(&doc), 1);
    assert_eq!(doc.history().len(), 4);

    let (_, section) = doc.sections().next().unwrap();
    assert_eq!(section.as_text().unwrap().meta(MetaKind::ORIGIN), &[
      MetaRange::new(0, 16, Origin::Prompt.data()),
      MetaRange::new(16, 16, Origin::Ai.data()),
    ]);
  }

  #[test]
  fn other_branch_is_one_jump_away() {
    let story = LegacyStory {
      blocks:        vec![
        block(NO_BLOCK, &[1, 2], (0, 0), "Start.", LegacyOrigin::Prompt),
        block(0, &[], (6, 6), " Left.", LegacyOrigin::Ai),
        block(0, &[], (6, 6), " Right.", LegacyOrigin::Ai),
      ],
      current_block: 2,
    };
    let mut doc = converter().convert(&story).unwrap();
    assert_eq!(doc.text(), "Start. Right.");

    doc.pop_history().unwrap();
    assert_eq!(doc.text(), "Start.");
    let siblings = doc.descendents();
    doc.descend_history(Some(siblings[0])).unwrap();
    assert_eq!(doc.text(), "Start. Left.");
  }

  #[test]
  fn chains_share_a_node() {
    let story = LegacyStory {
      blocks:        vec![
        block(NO_BLOCK, &[1], (0, 0), "Hello", LegacyOrigin::Prompt),
        chained(block(0, &[], (5, 5), " world", LegacyOrigin::User)),
      ],
      current_block: 1,
    };
    let doc = converter().convert(&story).unwrap();
    assert_eq!(doc.text(), "Hello world");
    assert_eq!(doc.history().len(), 2);

    let mut config = Config::default();
    config.legacy.merge_chains = false;
    let doc = LegacyConverter::new(&config).convert(&story).unwrap();
    assert_eq!(doc.text(), "Hello world");
    assert_eq!(doc.history().len(), 3);
  }

  #[test]
  fn end_index_past_text_is_clamped() {
    let story = LegacyStory {
      blocks:        vec![
        block(NO_BLOCK, &[1], (0, 0), "Hello", LegacyOrigin::Prompt),
        block(0, &[], (3, 99), "p!", LegacyOrigin::Edit),
      ],
      current_block: 1,
    };
    let doc = converter().convert(&story).unwrap();
    assert_eq!(doc.text(), "Help!");
  }

  #[test]
  fn replacement_across_lines() {
    let story = LegacyStory {
      blocks:        vec![
        block(NO_BLOCK, &[1], (0, 0), "one\ntwo\nthree", LegacyOrigin::Prompt),
        block(0, &[], (2, 9), "E\nX", LegacyOrigin::User),
      ],
      current_block: 1,
    };
    let mut doc = converter().convert(&story).unwrap();
    assert_eq!(doc.text(), "onE\nXhree");
    assert_eq!(doc.len(), 2);

    doc.pop_history().unwrap();
    assert_eq!(doc.text(), "one\ntwo\nthree");
    assert_eq!(doc.len(), 3);
  }

  #[test]
  fn parses_camel_case_json() {
    let json = r#"{
      "currentBlock": 1,
      "blocks": [
        { "prevBlock": -1, "nextBlock": [1], "startIndex": 0, "endIndex": 0,
          "dataFragment": { "data": "Hi", "origin": "root" } },
        { "prevBlock": 0, "nextBlock": [], "startIndex": 2, "endIndex": 2,
          "dataFragment": { "data": " there", "origin": "user" }, "chain": true }
      ]
    }"#;
    let doc = converter().convert_json(json).unwrap();
    assert_eq!(doc.text(), "Hi there");
    assert!(matches!(
      converter().convert_json("{\"blocks\": 3}"),
      Err(LegacyError::Json(_))
    ));
  }

  #[test]
  fn malformed_stories_are_rejected() {
    let no_root = LegacyStory {
      blocks:        vec![block(0, &[], (0, 0), "x", LegacyOrigin::Ai)],
      current_block: 0,
    };
    assert!(matches!(converter().convert(&no_root), Err(LegacyError::MissingRoot)));

    let dangling = LegacyStory {
      blocks:        vec![block(NO_BLOCK, &[4], (0, 0), "x", LegacyOrigin::Root)],
      current_block: 0,
    };
    assert!(matches!(
      converter().convert(&dangling),
      Err(LegacyError::DanglingLink { from: 0, to: 4 })
    ));

    let looping = LegacyStory {
      blocks:        vec![
        block(NO_BLOCK, &[1], (0, 0), "x", LegacyOrigin::Root),
        block(0, &[1], (1, 1), "y", LegacyOrigin::Ai),
      ],
      current_block: 0,
    };
    assert!(matches!(
      converter().convert(&looping),
      Err(LegacyError::BrokenLink { parent: 1, child: 1 })
    ));

    let two_parents = LegacyStory {
      blocks:        vec![
        block(NO_BLOCK, &[1, 1], (0, 0), "x", LegacyOrigin::Root),
        block(0, &[], (1, 1), "y", LegacyOrigin::Ai),
      ],
      current_block: 0,
    };
    assert!(matches!(converter().convert(&two_parents), Err(LegacyError::Cycle(1))));

    let lost = LegacyStory {
      blocks:        vec![block(NO_BLOCK, &[], (0, 0), "x", LegacyOrigin::Root)],
      current_block: 3,
    };
    assert!(matches!(converter().convert(&lost), Err(LegacyError::MissingCurrent(3))));
  }
}
