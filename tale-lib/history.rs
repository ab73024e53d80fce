use std::{
  collections::{
    BTreeMap,
    HashSet,
  },
  fmt,
  time::SystemTime,
};

use indexmap::IndexSet;
use serde::{
  Deserialize,
  Serialize,
};
use thiserror::Error;

use crate::change::ChangeMap;

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// A history tree that does not describe a walkable history.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum HistoryError {
  #[error("history node {0} does not exist")]
  UnknownNode(HistoryNodeId),
  #[error("root node {0} has a parent")]
  RootHasParent(HistoryNodeId),
  #[error("root node {0} carries changes")]
  RootHasChanges(HistoryNodeId),
  #[error("node {0} has no parent")]
  MissingParent(HistoryNodeId),
  #[error("node {node} and its parent {parent} disagree about their link")]
  BrokenLink {
    node:   HistoryNodeId,
    parent: HistoryNodeId,
  },
  #[error("node {0} carries no changes")]
  EmptyNode(HistoryNodeId),
  #[error("route of node {node} points to {route}, which is not its child")]
  InvalidRoute {
    node:  HistoryNodeId,
    route: HistoryNodeId,
  },
  #[error("node {0} is not reachable from the root")]
  Unreachable(HistoryNodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryNodeId(u64);

impl HistoryNodeId {
  pub const fn new(id: u64) -> Self {
    Self(id)
  }

  pub const fn get(self) -> u64 {
    self.0
  }
}

impl fmt::Display for HistoryNodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "@{}", self.0)
  }
}

/// Whether a node's changes are being reverted or replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
  Undo,
  Redo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryNode {
  id:        HistoryNodeId,
  parent:    Option<HistoryNodeId>,
  #[serde(default)]
  children:  IndexSet<HistoryNodeId>,
  /// Child last left or entered through this node.
  #[serde(default)]
  route:     Option<HistoryNodeId>,
  #[serde(default)]
  changes:   ChangeMap,
  timestamp: SystemTime,
}

impl HistoryNode {
  fn root(id: HistoryNodeId, timestamp: SystemTime) -> Self {
    Self {
      id,
      parent: None,
      children: IndexSet::new(),
      route: None,
      changes: ChangeMap::new(),
      timestamp,
    }
  }

  pub fn id(&self) -> HistoryNodeId {
    self.id
  }

  pub fn parent(&self) -> Option<HistoryNodeId> {
    self.parent
  }

  /// Children in the order they were created.
  pub fn children(&self) -> &IndexSet<HistoryNodeId> {
    &self.children
  }

  pub fn route(&self) -> Option<HistoryNodeId> {
    self.route
  }

  /// Changes that lead from the parent to this node.
  pub fn changes(&self) -> &ChangeMap {
    &self.changes
  }

  pub fn timestamp(&self) -> SystemTime {
    self.timestamp
  }

  pub fn is_root(&self) -> bool {
    self.parent.is_none()
  }
}

/// One node crossed by a [`HistoryJump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryMove {
  pub node:      HistoryNodeId,
  pub direction: Direction,
}

/// A pending move through the tree that has not been applied yet.
///
/// Callers apply the changes of every move (reverting for
/// [`Direction::Undo`], replaying for [`Direction::Redo`]) and only then
/// call [`HistoryTree::apply_jump`], so the tree never points at a state
/// the document failed to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryJump {
  pub moves:  Vec<HistoryMove>,
  pub target: HistoryNodeId,
}

impl HistoryJump {
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.moves.is_empty()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.moves.len()
  }
}

/// Branching undo history.
///
/// Every node except the root stores the [`ChangeMap`] that takes its
/// parent's state to its own. Replaying the changes on the path from the
/// root to [`HistoryTree::current`] rebuilds the document. Undoing from a
/// node with several children and redoing again returns to the child that
/// was left, through the per-node `route`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HistoryParts", into = "HistoryParts")]
pub struct HistoryTree {
  root:    HistoryNodeId,
  current: HistoryNodeId,
  nodes:   BTreeMap<HistoryNodeId, HistoryNode>,
  next_id: u64,
}

/// Serialized shape of a [`HistoryTree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryParts {
  pub root:    HistoryNodeId,
  pub current: HistoryNodeId,
  pub nodes:   Vec<HistoryNode>,
}

impl Default for HistoryTree {
  fn default() -> Self {
    Self::new()
  }
}

impl HistoryTree {
  pub fn new() -> Self {
    Self::with_root_timestamp(SystemTime::now())
  }

  pub fn with_root_timestamp(timestamp: SystemTime) -> Self {
    let root = HistoryNodeId::new(0);
    Self {
      root,
      current: root,
      nodes: BTreeMap::from([(root, HistoryNode::root(root, timestamp))]),
      next_id: 1,
    }
  }

  /// Rebuilds a tree from its nodes, checking every structural invariant.
  pub fn from_parts(parts: HistoryParts) -> Result<Self> {
    let HistoryParts {
      root,
      current,
      nodes,
    } = parts;
    let nodes: BTreeMap<_, _> = nodes.into_iter().map(|node| (node.id, node)).collect();

    let root_node = nodes.get(&root).ok_or(HistoryError::UnknownNode(root))?;
    if root_node.parent.is_some() {
      return Err(HistoryError::RootHasParent(root));
    }
    if !root_node.changes.is_empty() {
      return Err(HistoryError::RootHasChanges(root));
    }
    if !nodes.contains_key(&current) {
      return Err(HistoryError::UnknownNode(current));
    }

    for node in nodes.values() {
      if node.id != root {
        let parent = node.parent.ok_or(HistoryError::MissingParent(node.id))?;
        let linked = nodes
          .get(&parent)
          .is_some_and(|parent| parent.children.contains(&node.id));
        if !linked {
          return Err(HistoryError::BrokenLink {
            node: node.id,
            parent,
          });
        }
        if node.changes.is_empty() {
          return Err(HistoryError::EmptyNode(node.id));
        }
      }
      for child in &node.children {
        if nodes.get(child).and_then(|child| child.parent) != Some(node.id) {
          return Err(HistoryError::BrokenLink {
            node:   *child,
            parent: node.id,
          });
        }
      }
      if let Some(route) = node.route
        && !node.children.contains(&route)
      {
        return Err(HistoryError::InvalidRoute {
          node: node.id,
          route,
        });
      }
    }

    let mut seen = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
      if seen.insert(id) {
        stack.extend(nodes[&id].children.iter().copied());
      }
    }
    if let Some(orphan) = nodes.keys().find(|id| !seen.contains(*id)) {
      return Err(HistoryError::Unreachable(*orphan));
    }

    let next_id = nodes.keys().last().map_or(0, |id| id.get()) + 1;
    Ok(Self {
      root,
      current,
      nodes,
      next_id,
    })
  }

  pub fn root(&self) -> HistoryNodeId {
    self.root
  }

  pub fn current(&self) -> HistoryNodeId {
    self.current
  }

  pub fn current_node(&self) -> &HistoryNode {
    &self.nodes[&self.current]
  }

  pub fn node(&self, id: HistoryNodeId) -> Option<&HistoryNode> {
    self.nodes.get(&id)
  }

  pub fn nodes(&self) -> impl Iterator<Item = &HistoryNode> {
    self.nodes.values()
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub const fn at_root(&self) -> bool {
    self.current.get() == self.root.get()
  }

  /// Records `changes` as a new child of the current node and moves there.
  ///
  /// The parent's route is left alone: it only changes when a move leaves
  /// or enters a child. Until then a bare redo picks the first child.
  pub fn push_state(&mut self, changes: ChangeMap) -> HistoryNodeId {
    self.push_state_at(changes, SystemTime::now())
  }

  pub fn push_state_at(&mut self, changes: ChangeMap, timestamp: SystemTime) -> HistoryNodeId {
    let id = HistoryNodeId::new(self.next_id);
    self.next_id += 1;

    let parent = self.current;
    self.nodes.insert(id, HistoryNode {
      id,
      parent: Some(parent),
      children: IndexSet::new(),
      route: None,
      changes,
      timestamp,
    });
    if let Some(parent) = self.nodes.get_mut(&parent) {
      parent.children.insert(id);
    }
    self.current = id;
    id
  }

  /// Moves to the parent of the current node. `None` at the root.
  pub fn pop_state(&mut self) -> Option<HistoryNodeId> {
    let jump = self.undo()?;
    let left = self.current;
    self.commit_jump(&jump);
    Some(left)
  }

  /// Moves to a child of the current node, see [`HistoryTree::redo`].
  pub fn descend_state(&mut self, branch: Option<HistoryNodeId>) -> Option<HistoryNodeId> {
    let jump = self.redo(branch)?;
    self.commit_jump(&jump);
    Some(jump.target)
  }

  /// Prepares a move to the parent without changing the tree.
  pub fn undo(&self) -> Option<HistoryJump> {
    let parent = self.current_node().parent?;
    Some(HistoryJump {
      moves:  vec![HistoryMove {
        node:      self.current,
        direction: Direction::Undo,
      }],
      target: parent,
    })
  }

  /// Prepares a move to a child without changing the tree.
  ///
  /// The child is `branch` if given (and a child of the current node), else
  /// the remembered route, else the first child created.
  pub fn redo(&self, branch: Option<HistoryNodeId>) -> Option<HistoryJump> {
    let target = self.next_child(self.current, branch)?;
    Some(HistoryJump {
      moves: vec![HistoryMove {
        node:      target,
        direction: Direction::Redo,
      }],
      target,
    })
  }

  fn next_child(&self, of: HistoryNodeId, branch: Option<HistoryNodeId>) -> Option<HistoryNodeId> {
    let node = self.nodes.get(&of)?;
    match branch {
      Some(branch) => node.children.contains(&branch).then_some(branch),
      None => node.route.or_else(|| node.children.first().copied()),
    }
  }

  /// Prepares a move to any node through the lowest common ancestor.
  pub fn jump_to(&self, to: HistoryNodeId) -> Result<HistoryJump> {
    if !self.nodes.contains_key(&to) {
      return Err(HistoryError::UnknownNode(to));
    }

    let lca = self.lowest_common_ancestor(self.current, to);
    let up = self.path_up(self.current, lca).into_iter().map(|node| HistoryMove {
      node,
      direction: Direction::Undo,
    });
    let down = self
      .path_up(to, lca)
      .into_iter()
      .rev()
      .map(|node| HistoryMove {
        node,
        direction: Direction::Redo,
      });

    Ok(HistoryJump {
      moves:  up.chain(down).collect(),
      target: to,
    })
  }

  /// Walks up to `steps` nodes towards the root.
  pub fn jump_backward(&self, steps: usize) -> HistoryJump {
    let mut target = self.current;
    for _ in 0..steps {
      match self.nodes[&target].parent {
        Some(parent) => target = parent,
        None => break,
      }
    }
    self.path_jump(target)
  }

  /// Walks up to `steps` nodes down the remembered routes.
  pub fn jump_forward(&self, steps: usize) -> HistoryJump {
    let mut target = self.current;
    for _ in 0..steps {
      match self.next_child(target, None) {
        Some(child) => target = child,
        None => break,
      }
    }
    self.path_jump(target)
  }

  fn path_jump(&self, target: HistoryNodeId) -> HistoryJump {
    self.jump_to(target).unwrap_or(HistoryJump {
      moves: Vec::new(),
      target: self.current,
    })
  }

  /// Moves to the jump's target. Only call once every move was applied.
  pub fn apply_jump(&mut self, jump: &HistoryJump) -> Result<()> {
    if !self.nodes.contains_key(&jump.target) {
      return Err(HistoryError::UnknownNode(jump.target));
    }
    self.commit_jump(jump);
    Ok(())
  }

  fn commit_jump(&mut self, jump: &HistoryJump) {
    for HistoryMove { node, .. } in &jump.moves {
      let parent = self.nodes.get(node).and_then(|node| node.parent);
      if let Some(parent) = parent.and_then(|parent| self.nodes.get_mut(&parent)) {
        parent.route = Some(*node);
      }
    }
    self.current = jump.target;
  }

  /// Nodes from the root (excluded) down to `to` (included).
  pub fn path_to(&self, to: HistoryNodeId) -> Result<Vec<HistoryNodeId>> {
    if !self.nodes.contains_key(&to) {
      return Err(HistoryError::UnknownNode(to));
    }
    let mut path = self.path_up(to, self.root);
    path.reverse();
    Ok(path)
  }

  fn lowest_common_ancestor(&self, mut a: HistoryNodeId, mut b: HistoryNodeId) -> HistoryNodeId {
    let mut a_path = HashSet::new();
    let mut b_path = HashSet::new();
    loop {
      a_path.insert(a);
      b_path.insert(b);
      if a_path.contains(&b) {
        return b;
      }
      if b_path.contains(&a) {
        return a;
      }
      // the root is its own parent here
      a = self.nodes[&a].parent.unwrap_or(a);
      b = self.nodes[&b].parent.unwrap_or(b);
    }
  }

  /// Nodes on the way from `n` up to its ancestor `a`, excluding `a`.
  fn path_up(&self, mut n: HistoryNodeId, a: HistoryNodeId) -> Vec<HistoryNodeId> {
    let mut path = Vec::new();
    while n != a {
      path.push(n);
      match self.nodes[&n].parent {
        Some(parent) => n = parent,
        None => break,
      }
    }
    path
  }
}

impl TryFrom<HistoryParts> for HistoryTree {
  type Error = HistoryError;

  fn try_from(parts: HistoryParts) -> Result<Self> {
    Self::from_parts(parts)
  }
}

impl From<HistoryTree> for HistoryParts {
  fn from(tree: HistoryTree) -> Self {
    Self {
      root:    tree.root,
      current: tree.current,
      nodes:   tree.nodes.into_values().collect(),
    }
  }
}

#[cfg(test)]
mod test {
  use std::time::Duration;

  use tale_core::{
    Section,
    SectionId,
  };

  use super::*;
  use crate::change::HistoryStep;

  fn changes(raw: u64) -> ChangeMap {
    let id = SectionId::from_raw(raw).unwrap();
    [(id, HistoryStep::Create {
      section: Section::text(format!("section {raw}")),
      after:   None,
    })]
    .into_iter()
    .collect()
  }

  fn node(id: u64) -> HistoryNodeId {
    HistoryNodeId::new(id)
  }

  #[test]
  fn test_push_pop_descend() {
    let mut tree = HistoryTree::new();
    assert!(tree.at_root());
    assert_eq!(tree.pop_state(), None);
    assert_eq!(tree.descend_state(None), None);

    let first = tree.push_state(changes(1));
    let second = tree.push_state(changes(2));
    assert_eq!(tree.current(), second);
    assert_eq!(tree.node(second).unwrap().parent(), Some(first));

    assert_eq!(tree.pop_state(), Some(second));
    assert_eq!(tree.pop_state(), Some(first));
    assert!(tree.at_root());
    assert_eq!(tree.descend_state(None), Some(first));
    assert_eq!(tree.descend_state(None), Some(second));
    assert_eq!(tree.descend_state(None), None);
  }

  #[test]
  fn test_undo_does_not_mutate_before_apply() {
    let mut tree = HistoryTree::new();
    let first = tree.push_state(changes(1));

    let jump = tree.undo().unwrap();
    assert_eq!(jump.target, tree.root());
    assert_eq!(jump.moves, [HistoryMove {
      node:      first,
      direction: Direction::Undo,
    }]);
    assert_eq!(tree.current(), first);

    tree.apply_jump(&jump).unwrap();
    assert!(tree.at_root());
  }

  #[test]
  fn test_route_remembers_last_branch() {
    let mut tree = HistoryTree::new();
    let a = tree.push_state(changes(1));
    tree.pop_state();
    let b = tree.push_state(changes(2));
    tree.pop_state();
    let c = tree.push_state(changes(3));
    assert_eq!(tree.current_node().id(), c);

    // leave c, come back to c rather than the first child
    tree.pop_state();
    assert_eq!(tree.descend_state(None), Some(c));
    tree.pop_state();

    // an explicit branch wins and becomes the new route
    assert_eq!(tree.descend_state(Some(b)), Some(b));
    tree.pop_state();
    assert_eq!(tree.descend_state(None), Some(b));
    tree.pop_state();

    // a node that is not a child is refused
    assert_eq!(tree.descend_state(Some(node(42))), None);
    assert!(tree.at_root());

    let children: Vec<_> = tree.node(tree.root()).unwrap().children().iter().copied().collect();
    assert_eq!(children, [a, b, c]);
  }

  #[test]
  fn test_without_route_first_child_wins() {
    let mut tree = HistoryTree::new();
    let a = tree.push_state(changes(1));
    tree.pop_state();
    tree.push_state(changes(2));
    tree.pop_state();

    let mut parts = HistoryParts::from(tree);
    for node in &mut parts.nodes {
      node.route = None;
    }
    let mut tree = HistoryTree::from_parts(parts).unwrap();
    assert_eq!(tree.descend_state(None), Some(a));
  }

  #[test]
  fn test_first_child_until_a_move_sets_the_route() {
    let mut tree = HistoryTree::new();
    let root = tree.root();
    let a = tree.push_state(changes(1));
    assert_eq!(tree.node(root).unwrap().route(), None);

    // leaving a records it, so the later sibling b does not win a bare redo
    tree.pop_state();
    let b = tree.push_state(changes(2));
    assert_eq!(tree.node(root).unwrap().route(), Some(a));
    tree.pop_state();
    assert_eq!(tree.node(root).unwrap().route(), Some(b));
    assert_eq!(tree.descend_state(None), Some(b));
  }

  #[test]
  fn test_jump_through_common_ancestor() {
    //   0 -> 1 -> 2
    //         \-> 3 -> 4
    let mut tree = HistoryTree::new();
    let one = tree.push_state(changes(1));
    let two = tree.push_state(changes(2));
    tree.pop_state();
    let three = tree.push_state(changes(3));
    let four = tree.push_state(changes(4));

    let jump = tree.jump_to(two).unwrap();
    let moves: Vec<_> = jump.moves.iter().map(|m| (m.node, m.direction)).collect();
    assert_eq!(moves, [
      (four, Direction::Undo),
      (three, Direction::Undo),
      (two, Direction::Redo),
    ]);
    tree.apply_jump(&jump).unwrap();
    assert_eq!(tree.current(), two);
    assert_eq!(tree.node(one).unwrap().route(), Some(two));

    assert_eq!(tree.path_to(four).unwrap(), [one, three, four]);
    assert!(tree.path_to(tree.root()).unwrap().is_empty());
    assert_eq!(tree.jump_to(node(99)), Err(HistoryError::UnknownNode(node(99))));
    assert!(tree.jump_to(two).unwrap().is_empty());
  }

  #[test]
  fn test_walk_backward_and_forward() {
    let mut tree = HistoryTree::new();
    let one = tree.push_state(changes(1));
    let two = tree.push_state(changes(2));
    let three = tree.push_state(changes(3));

    let back = tree.jump_backward(2);
    assert_eq!(back.target, one);
    assert_eq!(back.len(), 2);
    tree.apply_jump(&back).unwrap();

    assert_eq!(tree.jump_forward(10).target, three);
    assert_eq!(tree.jump_forward(1).target, two);
    assert_eq!(tree.jump_backward(10).target, tree.root());
  }

  #[test]
  fn test_roundtrips_through_parts() {
    let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
    let mut tree = HistoryTree::with_root_timestamp(start);
    tree.push_state_at(changes(1), start + Duration::from_secs(1));
    tree.pop_state();
    tree.push_state_at(changes(2), start + Duration::from_secs(2));

    let json = serde_json::to_string(&tree).unwrap();
    let mut back: HistoryTree = serde_json::from_str(&json).unwrap();
    assert_eq!(back, tree);

    // ids keep counting past the loaded nodes
    let next = back.push_state(changes(3));
    assert_eq!(next, node(3));
  }

  #[test]
  fn test_malformed_trees_are_rejected() {
    let mut tree = HistoryTree::new();
    let one = tree.push_state(changes(1));
    let parts = HistoryParts::from(tree);

    let mut empty = parts.clone();
    empty.nodes[1].changes = ChangeMap::new();
    assert_eq!(HistoryTree::from_parts(empty), Err(HistoryError::EmptyNode(one)));

    let mut orphan = parts.clone();
    orphan.nodes[0].children.clear();
    orphan.nodes[0].route = None;
    assert_eq!(
      HistoryTree::from_parts(orphan),
      Err(HistoryError::BrokenLink {
        node:   one,
        parent: node(0),
      })
    );

    let mut routed = parts.clone();
    routed.nodes[1].route = Some(node(7));
    assert_eq!(
      HistoryTree::from_parts(routed),
      Err(HistoryError::InvalidRoute {
        node:  one,
        route: node(7),
      })
    );

    let mut rooted = parts.clone();
    rooted.nodes[0].changes = changes(5);
    assert_eq!(
      HistoryTree::from_parts(rooted),
      Err(HistoryError::RootHasChanges(node(0)))
    );

    let mut lost = parts;
    lost.current = node(9);
    assert_eq!(HistoryTree::from_parts(lost), Err(HistoryError::UnknownNode(node(9))));
  }
}
