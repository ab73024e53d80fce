use tale_core::{
  MetaKind,
  MetaRange,
  Section,
  TextSection,
  diff::diff,
};
use tale_lib::{
  ChangeMap,
  Document,
  HistoryNodeId,
  HistoryStep,
};

const MAX_TEXT_BYTES: usize = 512;
const MAX_OPS: usize = 96;
const MAX_RANGES: usize = 8;

#[derive(Debug, Clone)]
pub enum Op {
  Splice {
    pick:   u8,
    anchor: u16,
    delete: u16,
    insert: TextSection,
  },
  Create {
    pick:   u8,
    insert: TextSection,
  },
  Remove {
    pick: u8,
  },
  Commit,
  Undo,
  Redo {
    branch: u8,
  },
  Discard,
}

pub fn decode_ops(data: &[u8]) -> (Vec<TextSection>, Vec<Op>) {
  let mut cursor = ByteCursor::new(data);
  let initial_count = cursor.next_usize(4);
  let initial = (0..initial_count).map(|_| cursor.next_section()).collect();
  let op_count = cursor.next_usize(MAX_OPS);
  let mut ops = Vec::with_capacity(op_count);
  for _ in 0..op_count {
    let op = match cursor.next_u8() % 7 {
      0 => Op::Splice {
        pick:   cursor.next_u8(),
        anchor: cursor.next_u16(),
        delete: cursor.next_u16(),
        insert: cursor.next_section(),
      },
      1 => Op::Create {
        pick:   cursor.next_u8(),
        insert: cursor.next_section(),
      },
      2 => Op::Remove {
        pick: cursor.next_u8(),
      },
      3 => Op::Commit,
      4 => Op::Undo,
      5 => Op::Redo {
        branch: cursor.next_u8(),
      },
      _ => Op::Discard,
    };
    ops.push(op);
  }
  (initial, ops)
}

/// Applies one op, returning the node reached when the op moved through
/// history.
pub fn apply_op(doc: &mut Document, op: &Op) -> Option<HistoryNodeId> {
  let ids: Vec<_> = doc.sections().map(|(id, _)| id).collect();
  let pick = |pick: u8| (!ids.is_empty()).then(|| ids[pick as usize % ids.len()]);

  match op {
    Op::Splice {
      pick: p,
      anchor,
      delete,
      insert,
    } => {
      let id = pick(*p)?;
      let Section::Text(old) = doc.section(id)?.clone() else {
        return None;
      };
      let len = old.len_chars();
      let at = *anchor as usize % (len + 1);
      let delete = *delete as usize % (len - at + 1);
      let new = Section::Text(old.splice(at, delete, insert));
      let step = HistoryStep::Update {
        diff: diff(&Section::Text(old), &new),
      };
      push(doc, id, step);
      None
    },
    Op::Create { pick: p, insert } => {
      let after = pick(*p);
      let id = doc.allocate_section_id();
      push(doc, id, HistoryStep::Create {
        section: Section::Text(insert.clone()),
        after,
      });
      None
    },
    Op::Remove { pick: p } => {
      let id = pick(*p)?;
      let previous = doc.section(id)?.clone();
      let after = doc.section_list().predecessor(id);
      push(doc, id, HistoryStep::Remove { previous, after });
      None
    },
    Op::Commit => {
      doc.push_history();
      None
    },
    Op::Undo => {
      doc.pop_history().expect("undo failed")?;
      Some(doc.current_history_node())
    },
    Op::Redo { branch } => {
      let children = doc.descendents();
      let branch = match *branch as usize % (children.len() + 1) {
        0 => None,
        index => Some(children[index - 1]),
      };
      doc.descend_history(branch).expect("redo failed")?;
      Some(doc.current_history_node())
    },
    Op::Discard => {
      doc.discard_staged().expect("discard failed");
      None
    },
  }
}

fn push(doc: &mut Document, id: tale_core::SectionId, step: HistoryStep) {
  let changes: ChangeMap = [(id, step)].into_iter().collect();
  doc.push_change(changes).expect("valid change was rejected");
}

pub struct ByteCursor<'a> {
  data: &'a [u8],
  pos:  usize,
}

impl<'a> ByteCursor<'a> {
  pub fn new(data: &'a [u8]) -> Self {
    Self { data, pos: 0 }
  }

  pub fn next_u8(&mut self) -> u8 {
    let value = self.data.get(self.pos).copied().unwrap_or(0);
    self.pos = self.pos.saturating_add(1);
    value
  }

  pub fn next_u16(&mut self) -> u16 {
    let lo = self.next_u8() as u16;
    let hi = self.next_u8() as u16;
    lo | (hi << 8)
  }

  pub fn next_usize(&mut self, max: usize) -> usize {
    if max == 0 {
      return 0;
    }
    (self.next_u16() as usize) % (max + 1)
  }

  fn next_bytes(&mut self, len: usize) -> &'a [u8] {
    let start = self.pos.min(self.data.len());
    let end = start.saturating_add(len).min(self.data.len());
    self.pos = end;
    &self.data[start..end]
  }

  /// Text plus a few origin ranges laid end to end over it.
  pub fn next_section(&mut self) -> TextSection {
    let len = self.next_usize(MAX_TEXT_BYTES);
    let text = String::from_utf8_lossy(self.next_bytes(len)).into_owned();
    let chars = text.chars().count();
    let mut ranges = Vec::new();
    let mut position = 0;
    for _ in 0..self.next_usize(MAX_RANGES) {
      let length = self.next_usize(chars.saturating_sub(position));
      let data = (self.next_u8() % 4) as i32 + 1;
      ranges.push(MetaRange::new(position, length, data));
      position += length;
    }
    TextSection::new(text).with_meta(MetaKind::ORIGIN, ranges)
  }
}
