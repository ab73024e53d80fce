//! Character-level text diffing.
//!
//! The common prefix and suffix are stripped, the middle is diffed with
//! Myers over characters, and the resulting edit script is then cleaned up
//! so that short equal runs wedged between edits are folded into those
//! edits. Without that cleanup a diff between two rewrites of a sentence
//! degenerates into dozens of one-letter hunks.

use imara_diff::{
  Algorithm,
  Diff,
  Hunk,
  InternedInput,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
  Equal(String),
  Delete(String),
  Insert(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditKind {
  Equal,
  Delete,
  Insert,
}

impl Edit {
  fn kind(&self) -> EditKind {
    match self {
      Self::Equal(_) => EditKind::Equal,
      Self::Delete(_) => EditKind::Delete,
      Self::Insert(_) => EditKind::Insert,
    }
  }

  pub fn text(&self) -> &str {
    match self {
      Self::Equal(text) | Self::Delete(text) | Self::Insert(text) => text,
    }
  }

  fn text_mut(&mut self) -> &mut String {
    match self {
      Self::Equal(text) | Self::Delete(text) | Self::Insert(text) => text,
    }
  }
}

fn collect(chars: &[char]) -> String {
  chars.iter().collect()
}

/// Appends `edit`, merging with the previous edit of the same kind.
fn push_edit(edits: &mut Vec<Edit>, edit: Edit) {
  if edit.text().is_empty() {
    return;
  }
  if let Some(prev) = edits.last_mut()
    && prev.kind() == edit.kind()
  {
    prev.text_mut().push_str(edit.text());
    return;
  }
  edits.push(edit);
}

/// Computes an edit script turning `before` into `after`.
///
/// `edit_cost` is the cleanup threshold in characters; `max_chars` bounds
/// the size of the middle section that is diffed character by character,
/// anything larger is treated as one replacement.
pub fn diff_text(before: &str, after: &str, edit_cost: usize, max_chars: usize) -> Vec<Edit> {
  let mut edits = Vec::new();
  if before == after {
    push_edit(&mut edits, Edit::Equal(before.to_owned()));
    return edits;
  }

  let before: Vec<char> = before.chars().collect();
  let after: Vec<char> = after.chars().collect();

  let prefix = before
    .iter()
    .zip(&after)
    .take_while(|(a, b)| a == b)
    .count();
  let suffix = before[prefix..]
    .iter()
    .rev()
    .zip(after[prefix..].iter().rev())
    .take_while(|(a, b)| a == b)
    .count();
  let mid_before = &before[prefix..before.len() - suffix];
  let mid_after = &after[prefix..after.len() - suffix];

  push_edit(&mut edits, Edit::Equal(collect(&before[..prefix])));
  if mid_before.is_empty() || mid_after.is_empty() || mid_before.len() + mid_after.len() > max_chars
  {
    push_edit(&mut edits, Edit::Delete(collect(mid_before)));
    push_edit(&mut edits, Edit::Insert(collect(mid_after)));
  } else {
    diff_middle(&mut edits, mid_before, mid_after);
  }
  push_edit(&mut edits, Edit::Equal(collect(&before[before.len() - suffix..])));

  if cleanup_efficiency(&mut edits, edit_cost) {
    edits = cleanup_merge(edits);
  }
  edits
}

fn diff_middle(edits: &mut Vec<Edit>, before: &[char], after: &[char]) {
  let mut input: InternedInput<char> = InternedInput::default();
  input.update_before(before.iter().copied());
  input.update_after(after.iter().copied());

  // the histogram heuristic does not work well for characters, which
  // reoccur constantly
  let mut diff = Diff::default();
  diff.compute_with(
    Algorithm::Myers,
    &input.before,
    &input.after,
    input.interner.num_tokens(),
  );

  let mut pos = 0;
  for Hunk {
    before: removed,
    after: added,
  } in diff.hunks()
  {
    push_edit(
      edits,
      Edit::Equal(collect(&before[pos..removed.start as usize])),
    );
    push_edit(
      edits,
      Edit::Delete(collect(&before[removed.start as usize..removed.end as usize])),
    );
    push_edit(
      edits,
      Edit::Insert(collect(&after[added.start as usize..added.end as usize])),
    );
    pos = removed.end as usize;
  }
  push_edit(edits, Edit::Equal(collect(&before[pos..])));
}

/// Turns short equalities surrounded by edits into a delete/insert pair.
///
/// An equality is eliminated when it has edits of both kinds on both sides,
/// or when it is shorter than half the edit cost and has three of the four.
/// Returns true if anything changed.
fn cleanup_efficiency(edits: &mut Vec<Edit>, edit_cost: usize) -> bool {
  let mut changed = false;
  let mut equalities: Vec<usize> = Vec::new();
  let mut last_equality: Option<String> = None;
  let mut pre_ins = false;
  let mut pre_del = false;
  let mut post_ins = false;
  let mut post_del = false;
  let mut pointer = 0;

  while pointer < edits.len() {
    match edits[pointer].kind() {
      EditKind::Equal => {
        let text = edits[pointer].text();
        if text.chars().count() < edit_cost && (post_ins || post_del) {
          equalities.push(pointer);
          pre_ins = post_ins;
          pre_del = post_del;
          last_equality = Some(text.to_owned());
        } else {
          equalities.clear();
          last_equality = None;
        }
        post_ins = false;
        post_del = false;
      },
      kind => {
        if kind == EditKind::Delete {
          post_del = true;
        } else {
          post_ins = true;
        }

        let sides = [pre_ins, pre_del, post_ins, post_del]
          .into_iter()
          .filter(|side| *side)
          .count();
        let eliminate = last_equality.as_ref().is_some_and(|equality| {
          sides == 4 || (equality.chars().count() * 2 < edit_cost && sides == 3)
        });

        let target = if eliminate {
          equalities.last().copied().zip(last_equality.take())
        } else {
          None
        };
        if let Some((at, equality)) = target {
          edits[at] = Edit::Delete(equality.clone());
          edits.insert(at + 1, Edit::Insert(equality));
          equalities.pop();
          changed = true;

          if pre_ins && pre_del {
            post_ins = true;
            post_del = true;
            equalities.clear();
          } else {
            equalities.pop();
            post_ins = false;
            post_del = false;
            pointer = equalities.last().map_or(0, |&at| at + 1);
            continue;
          }
        }
      },
    }
    pointer += 1;
  }
  changed
}

/// Coalesces each run of edits between equalities into at most one delete
/// followed by one insert.
fn cleanup_merge(edits: Vec<Edit>) -> Vec<Edit> {
  let mut out = Vec::with_capacity(edits.len());
  let mut deleted = String::new();
  let mut inserted = String::new();
  for edit in edits {
    match edit {
      Edit::Delete(text) => deleted.push_str(&text),
      Edit::Insert(text) => inserted.push_str(&text),
      Edit::Equal(text) => {
        push_edit(&mut out, Edit::Delete(std::mem::take(&mut deleted)));
        push_edit(&mut out, Edit::Insert(std::mem::take(&mut inserted)));
        push_edit(&mut out, Edit::Equal(text));
      },
    }
  }
  push_edit(&mut out, Edit::Delete(deleted));
  push_edit(&mut out, Edit::Insert(inserted));
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rebuild(edits: &[Edit]) -> (String, String) {
    let mut before = String::new();
    let mut after = String::new();
    for edit in edits {
      match edit {
        Edit::Equal(text) => {
          before.push_str(text);
          after.push_str(text);
        },
        Edit::Delete(text) => before.push_str(text),
        Edit::Insert(text) => after.push_str(text),
      }
    }
    (before, after)
  }

  #[test]
  fn equal_texts() {
    assert_eq!(diff_text("same", "same", 4, 1000), vec![Edit::Equal("same".into())]);
    assert!(diff_text("", "", 4, 1000).is_empty());
  }

  #[test]
  fn append_only() {
    assert_eq!(diff_text("World", "World!", 4, 1000), vec![
      Edit::Equal("World".into()),
      Edit::Insert("!".into()),
    ]);
  }

  #[test]
  fn replacement_in_middle() {
    let edits = diff_text("the cat sat", "the dog sat", 4, 1000);
    assert_eq!(edits, vec![
      Edit::Equal("the ".into()),
      Edit::Delete("cat".into()),
      Edit::Insert("dog".into()),
      Edit::Equal(" sat".into()),
    ]);
  }

  #[test]
  fn short_equalities_are_absorbed() {
    // A one-character match splits what is really a single rewrite.
    let mut edits = vec![
      Edit::Delete("ab".into()),
      Edit::Insert("12".into()),
      Edit::Equal("x".into()),
      Edit::Delete("cd".into()),
      Edit::Insert("34".into()),
    ];
    assert!(cleanup_efficiency(&mut edits, 4));
    let edits = cleanup_merge(edits);
    assert_eq!(edits, vec![
      Edit::Delete("abxcd".into()),
      Edit::Insert("12x34".into()),
    ]);
  }

  #[test]
  fn long_equalities_survive_cleanup() {
    let mut edits = vec![
      Edit::Delete("ab".into()),
      Edit::Insert("12".into()),
      Edit::Equal("wxyz".into()),
      Edit::Delete("cd".into()),
      Edit::Insert("34".into()),
    ];
    assert!(!cleanup_efficiency(&mut edits, 4));
  }

  #[test]
  fn oversized_middle_is_replaced_whole() {
    let edits = diff_text("abcXdef", "abcYYdef", 4, 2);
    assert_eq!(edits, vec![
      Edit::Equal("abc".into()),
      Edit::Delete("X".into()),
      Edit::Insert("YY".into()),
      Edit::Equal("def".into()),
    ]);
  }

  #[test]
  fn handles_multibyte_characters() {
    let edits = diff_text("héllo wörld", "hallo wörld!", 4, 1000);
    assert_eq!(rebuild(&edits), ("héllo wörld".into(), "hallo wörld!".into()));
  }

  quickcheck::quickcheck! {
    fn edits_rebuild_both_sides(a: String, b: String) -> bool {
      let edits = diff_text(&a, &b, 4, 10_000);
      rebuild(&edits) == (a, b)
    }
  }
}
