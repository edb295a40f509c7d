//! The compressed latest-message tree (CLMT).
//!
//! At all times this tree equals the topological skeleton of "ancestors
//! plus branch points" of the set of currently latest blocks, one per
//! validator. Unlike `rensa`'s original `forktree.rs` — which links
//! parent/child with an `unsafe` raw `*mut TreeNode` — nodes here live in
//! an arena and are addressed by [`NodeId`], so there is no aliasing or
//! lifetime hazard in the parent back-link.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;

use tracing::{debug, trace};

use crate::block::Block;
use crate::error::{ForkChoiceError, Result};

/// Stable handle to a node in a [`CompressedTree`].
///
/// `NodeId`s are invalidated by [`CompressedTree::prune`]: pruning rebuilds
/// the arena from the surviving subtree and hands out fresh ids. Do not
/// retain a `NodeId` across a `prune` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

struct Slot<P, V> {
  block: Block<P>,
  parent: Option<NodeId>,
  children: Vec<NodeId>,
  /// Validators for whom this node is the current latest block. A
  /// reference count rather than a boolean: two validators may coincide
  /// on the same latest block, and the node must stay weighted until the
  /// last of them retracts.
  weight_holders: HashSet<V>,
}

impl<P, V> Slot<P, V> {
  fn has_weight(&self) -> bool {
    !self.weight_holders.is_empty()
  }
}

/// A read-only view of one node, borrowed from its owning tree.
pub struct Node<'a, P, V> {
  tree: &'a CompressedTree<P, V>,
  id: NodeId,
}

impl<'a, P, V> Node<'a, P, V> {
  pub fn id(&self) -> NodeId {
    self.id
  }

  pub fn block(&self) -> &'a Block<P> {
    &self.tree.slot(self.id).block
  }

  pub fn parent(&self) -> Option<Node<'a, P, V>> {
    self.tree.slot(self.id).parent.map(|id| self.tree.node(id))
  }

  pub fn children(&self) -> impl Iterator<Item = Node<'a, P, V>> + 'a {
    let tree = self.tree;
    self.tree.slot(self.id).children.iter().map(move |&id| tree.node(id))
  }

  pub fn has_weight(&self) -> bool {
    self.tree.slot(self.id).has_weight()
  }

  /// Number of validators currently holding this node as their latest
  /// message.
  pub fn weight_holder_count(&self) -> usize {
    self.tree.slot(self.id).weight_holders.len()
  }
}

impl<'a, P, V> Clone for Node<'a, P, V> {
  fn clone(&self) -> Self {
    Node { tree: self.tree, id: self.id }
  }
}
impl<'a, P, V> Copy for Node<'a, P, V> {}

/// Outcome of [`CompressedTree::add_latest`].
#[derive(Debug)]
pub enum Insertion {
  /// The block was installed (possibly after retracting the sender's
  /// previous latest block and/or splitting off a new branch point).
  Inserted(NodeId),
  /// The block does not descend from the tree's current root and was
  /// silently skipped.
  Ignored,
}

/// A dynamic, compressed view over the latest blocks of a validator set.
pub struct CompressedTree<P, V> {
  arena: Vec<Option<Slot<P, V>>>,
  root: NodeId,
  latest_of: HashMap<V, NodeId>,
  /// Occupied heights; binary search over this predicate is unsound on a
  /// non-contiguous height set, so lookups always scan it descending.
  nodes_at_height: BTreeMap<u64, Vec<NodeId>>,
  /// `block -> node` for every node currently in the tree.
  block_to_node: HashMap<Block<P>, NodeId>,
  /// `block -> node`, keyed by the block one step below a node's parent
  /// on the path down to that node. Distinct from `block_to_node` in
  /// general.
  path_index: HashMap<Block<P>, NodeId>,
}

impl<P, V: Clone + Eq + Hash + std::fmt::Debug> CompressedTree<P, V> {
  pub fn new(genesis: Block<P>) -> Self {
    let mut tree = CompressedTree {
      arena: Vec::new(),
      root: NodeId(0),
      latest_of: HashMap::new(),
      nodes_at_height: BTreeMap::new(),
      block_to_node: HashMap::new(),
      path_index: HashMap::new(),
    };
    let root = tree.alloc(Slot {
      block: genesis,
      parent: None,
      children: Vec::new(),
      weight_holders: HashSet::new(),
    });
    tree.root = root;
    tree
  }

  pub fn root(&self) -> NodeId {
    self.root
  }

  pub fn node(&self, id: NodeId) -> Node<'_, P, V> {
    Node { tree: self, id }
  }

  /// Number of live nodes in the tree. Bounded by `2V - 1` for `V`
  /// validators that currently have a latest block.
  pub fn len(&self) -> usize {
    self.arena.iter().filter(|s| s.is_some()).count()
  }

  fn slot(&self, id: NodeId) -> &Slot<P, V> {
    self.arena[id.0].as_ref().expect("dangling NodeId")
  }

  fn slot_mut(&mut self, id: NodeId) -> &mut Slot<P, V> {
    self.arena[id.0].as_mut().expect("dangling NodeId")
  }

  fn alloc(&mut self, slot: Slot<P, V>) -> NodeId {
    let id = NodeId(self.arena.len());
    self.nodes_at_height.entry(slot.block.height()).or_default().push(id);
    self.block_to_node.insert(slot.block.clone(), id);
    self.arena.push(Some(slot));
    id
  }

  fn node_with_block(&self, block: &Block<P>) -> Option<NodeId> {
    self.block_to_node.get(block).copied()
  }

  /// The deepest node whose block is an ancestor of (or equal to)
  /// `block`, found by a descending scan over occupied heights.
  fn find_prev_node_in_tree(&self, block: &Block<P>) -> Result<Option<NodeId>> {
    for &h in self.nodes_at_height.keys().rev() {
      if h > block.height() {
        continue;
      }
      let ancestor = block.prev_at_height(h)?;
      if let Some(id) = self.node_with_block(&ancestor) {
        return Ok(Some(id));
      }
    }
    Ok(None)
  }

  /// Installs `block` as `validator`'s new latest message, implicitly
  /// retracting its previous one.
  pub fn add_latest(&mut self, block: Block<P>, validator: V) -> Result<Insertion> {
    if let Some(&old) = self.latest_of.get(&validator) {
      self.remove_node(old, &validator)?;
    }

    let prev = match self.find_prev_node_in_tree(&block)? {
      Some(id) => id,
      None => {
        debug!("block at height {} does not descend from the current root; ignored", block.height());
        return Ok(Insertion::Ignored);
      }
    };

    if self.slot(prev).block == block {
      // another validator's latest already landed on this exact node:
      // just add a weight holder, no structural change needed.
      self.slot_mut(prev).weight_holders.insert(validator.clone());
      self.latest_of.insert(validator, prev);
      return Ok(Insertion::Inserted(prev));
    }

    let prev_height = self.slot(prev).block.height();
    let path_key = block.prev_at_height(prev_height + 1)?;

    let new_node = if let Some(&sibling) = self.path_index.get(&path_key) {
      self.insert_with_split(prev, path_key, sibling, block)?
    } else {
      self.insert_as_child(prev, path_key, block)
    };

    self.slot_mut(new_node).weight_holders.insert(validator.clone());
    self.latest_of.insert(validator, new_node);
    Ok(Insertion::Inserted(new_node))
  }

  fn insert_as_child(&mut self, parent: NodeId, path_key: Block<P>, block: Block<P>) -> NodeId {
    let node = self.alloc(Slot {
      block,
      parent: Some(parent),
      children: Vec::new(),
      weight_holders: HashSet::new(),
    });
    self.slot_mut(parent).children.push(node);
    self.path_index.insert(path_key, node);
    node
  }

  /// The path-overlap case: `block` diverges from an existing `sibling`
  /// somewhere strictly below `prev`. Splits off a new branch-point node
  /// at their LCA.
  fn insert_with_split(
    &mut self,
    prev: NodeId,
    path_key: Block<P>,
    sibling: NodeId,
    block: Block<P>,
  ) -> Result<NodeId> {
    let sibling_block = self.slot(sibling).block.clone();
    let anc = block.lca(&sibling_block)?;
    let prev_block = self.slot(prev).block.clone();
    if anc == prev_block {
      return Err(ForkChoiceError::InvariantViolated(
        "path overlap resolved to the existing parent; tree already had a direct child at this block".into(),
      ));
    }

    // A: new interior branch point at the divergence point.
    let branch = self.alloc(Slot {
      block: anc.clone(),
      parent: Some(prev),
      children: vec![sibling],
      weight_holders: HashSet::new(),
    });

    // Reparent the sibling under the new branch point.
    self.slot_mut(prev).children.retain(|&c| c != sibling);
    self.slot_mut(prev).children.push(branch);
    self.slot_mut(sibling).parent = Some(branch);

    // N: the new latest-message leaf.
    let leaf = self.alloc(Slot {
      block: block.clone(),
      parent: Some(branch),
      children: Vec::new(),
      weight_holders: HashSet::new(),
    });
    self.slot_mut(branch).children.push(leaf);

    // path_index bookkeeping: the old entry at path_key pointed from
    // `prev` toward `sibling`; it now points from `prev` toward `branch`.
    self.path_index.insert(path_key, branch);
    let sibling_key = sibling_block.prev_at_height(anc.height() + 1)?;
    self.path_index.insert(sibling_key, sibling);
    let leaf_key = block.prev_at_height(anc.height() + 1)?;
    self.path_index.insert(leaf_key, leaf);

    trace!(branch = anc.height(), "split branch point created");
    Ok(leaf)
  }

  /// Retracts `validator`'s hold on `node`.
  fn remove_node(&mut self, node: NodeId, validator: &V) -> Result<()> {
    self.slot_mut(node).weight_holders.remove(validator);
    if self.slot(node).has_weight() {
      // still held by another validator; nothing structural to do.
      return Ok(());
    }

    let children = self.slot(node).children.clone();
    match children.len() {
      n if n >= 2 => {
        // genuine branch point now; nothing structural to do.
        Ok(())
      }
      1 if node == self.root => {
        // the root is never spliced, even if it loses its last weight
        // holder.
        Ok(())
      }
      1 => {
        self.splice_single_child(node)?;
        Ok(())
      }
      _ => {
        let parent = self.slot(node).parent;
        self.detach_leaf(node)?;
        if let Some(parent) = parent {
          if parent != self.root
            && !self.slot(parent).has_weight()
            && self.slot(parent).children.len() == 1
          {
            debug!("compacting degree-1 branch point after retraction");
            self.splice_single_child(parent)?;
          }
        }
        Ok(())
      }
    }
  }

  /// Removes a childless, unweighted node from the tree entirely.
  fn detach_leaf(&mut self, node: NodeId) -> Result<()> {
    let slot = self.arena[node.0].take().expect("dangling NodeId");
    debug_assert!(slot.children.is_empty());

    if let Some(parent) = slot.parent {
      self.slot_mut(parent).children.retain(|&c| c != node);
    }
    self.block_to_node.remove(&slot.block);
    if let Some(ids) = self.nodes_at_height.get_mut(&slot.block.height()) {
      ids.retain(|&id| id != node);
      if ids.is_empty() {
        self.nodes_at_height.remove(&slot.block.height());
      }
    }
    if let Some(parent) = slot.parent {
      let parent_height = self.slot(parent).block.height();
      let key = slot.block.prev_at_height(parent_height + 1)?;
      if self.path_index.get(&key) == Some(&node) {
        self.path_index.remove(&key);
      }
    }
    Ok(())
  }

  /// Removes a one-child node, reparenting its only child in its place.
  fn splice_single_child(&mut self, node: NodeId) -> Result<()> {
    let slot = self.arena[node.0].take().expect("dangling NodeId");
    let child = slot.children[0];
    let parent = slot.parent;

    self.slot_mut(child).parent = parent;
    if let Some(parent) = parent {
      self.slot_mut(parent).children.retain(|&c| c != node);
      self.slot_mut(parent).children.push(child);

      let parent_height = self.slot(parent).block.height();
      let key = slot.block.prev_at_height(parent_height + 1)?;
      self.path_index.insert(key, child);
    }

    self.block_to_node.remove(&slot.block);
    if let Some(ids) = self.nodes_at_height.get_mut(&slot.block.height()) {
      ids.retain(|&id| id != node);
      if ids.is_empty() {
        self.nodes_at_height.remove(&slot.block.height());
      }
    }
    Ok(())
  }

  /// Detaches the subtree rooted at `new_root` and discards everything
  /// else, rebuilding the arena from scratch so no stale `NodeId` can
  /// alias a reused slot.
  pub fn prune(&mut self, new_root: NodeId) -> Result<()> {
    let mut surviving = Vec::new();
    let mut stack = vec![new_root];
    while let Some(id) = stack.pop() {
      surviving.push(id);
      stack.extend(self.slot(id).children.iter().copied());
    }
    let surviving: HashSet<NodeId> = surviving.into_iter().collect();

    let mut new_tree = CompressedTree {
      arena: Vec::new(),
      root: NodeId(0),
      latest_of: HashMap::new(),
      nodes_at_height: BTreeMap::new(),
      block_to_node: HashMap::new(),
      path_index: HashMap::new(),
    };

    let mut remap: HashMap<NodeId, NodeId> = HashMap::new();
    let order = self.topological_order(new_root);
    for old_id in &order {
      let old = self.slot(*old_id);
      let new_id = new_tree.alloc(Slot {
        block: old.block.clone(),
        parent: None, // patched below
        children: Vec::new(), // patched below
        weight_holders: old.weight_holders.clone(),
      });
      remap.insert(*old_id, new_id);
    }
    for old_id in &order {
      let old = self.slot(*old_id);
      let new_id = remap[old_id];
      let new_parent = old.parent.filter(|p| surviving.contains(p)).map(|p| remap[&p]);
      let new_children: Vec<NodeId> = old.children.iter().map(|c| remap[c]).collect();
      let slot = new_tree.slot_mut(new_id);
      slot.parent = new_parent;
      slot.children = new_children;
    }

    for (validator, old_id) in self.latest_of.drain() {
      if let Some(&new_id) = remap.get(&old_id) {
        new_tree.latest_of.insert(validator, new_id);
      }
    }

    // path_index for every non-root surviving node, recomputed from its
    // defining formula rather than carried over verbatim.
    for old_id in &order {
      if *old_id == new_root {
        continue;
      }
      let old = self.slot(*old_id);
      let parent_old = old.parent.expect("non-root has a parent");
      let parent_height = self.slot(parent_old).block.height();
      let key = old.block.prev_at_height(parent_height + 1)?;
      new_tree.path_index.insert(key, remap[old_id]);
    }

    new_tree.root = remap[&new_root];
    debug!(surviving = order.len(), "pruned compressed tree");
    *self = new_tree;
    Ok(())
  }

  fn topological_order(&self, start: NodeId) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
      order.push(id);
      stack.extend(self.slot(id).children.iter().copied());
    }
    order
  }

  /// Two-phase GHOST: accumulate subtree weight, then greedily descend
  /// into the heaviest child, tie-breaking on the child block's monotonic
  /// id (lower id wins).
  pub fn find_head<F>(&self, weight: F) -> Node<'_, P, V>
  where
    F: Fn(&Block<P>) -> u64,
  {
    let mut scores: HashMap<NodeId, u64> = HashMap::new();
    for &id in self.topological_order(self.root).iter().rev() {
      let own = weight(&self.slot(id).block);
      let children_total: u64 =
        self.slot(id).children.iter().map(|c| scores[c]).sum();
      scores.insert(id, own + children_total);
    }

    let mut current = self.root;
    loop {
      let children = &self.slot(current).children;
      if children.is_empty() {
        break;
      }
      current = *children
        .iter()
        .max_by(|&&a, &&b| {
          scores[&a]
            .cmp(&scores[&b])
            .then_with(|| self.slot(b).block.id().cmp(&self.slot(a).block.id()))
        })
        .expect("children is non-empty");
    }
    self.node(current)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::Block;

  fn child<P: Clone>(parent: &Block<P>, payload: P) -> Block<P> {
    Block::new(Some(parent.clone()), payload)
  }

  #[test]
  fn insert_on_genesis() {
    let genesis = Block::new(None, 0u8);
    let mut tree: CompressedTree<u8, u64> = CompressedTree::new(genesis.clone());
    let b = child(&genesis, 1);
    match tree.add_latest(b.clone(), 0).unwrap() {
      Insertion::Inserted(id) => {
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.node(tree.root()).block(), &genesis);
        let root_children: Vec<_> = tree.node(tree.root()).children().collect();
        assert_eq!(root_children.len(), 1);
        assert_eq!(root_children[0].id(), id);
        assert_eq!(root_children[0].block(), &b);
      }
      Insertion::Ignored => panic!("expected insertion"),
    }
  }

  #[test]
  fn chain_replacement_retracts_old_latest() {
    let genesis = Block::new(None, 0u8);
    let mut tree: CompressedTree<u8, u64> = CompressedTree::new(genesis.clone());
    let b1 = child(&genesis, 1);
    tree.add_latest(b1.clone(), 0).unwrap();
    let b2 = child(&b1, 2);
    tree.add_latest(b2.clone(), 0).unwrap();

    assert_eq!(tree.len(), 2);
    let root_children: Vec<_> = tree.node(tree.root()).children().collect();
    assert_eq!(root_children.len(), 1);
    assert_eq!(root_children[0].block(), &b2);
  }

  #[test]
  fn branch_insertion_creates_unweighted_interior_node() {
    let genesis = Block::new(None, 0u8);
    let mut tree: CompressedTree<u8, u64> = CompressedTree::new(genesis.clone());
    let b1 = child(&genesis, 1);
    tree.add_latest(b1.clone(), 0).unwrap();
    let b2 = child(&b1, 2);
    tree.add_latest(b2.clone(), 0).unwrap();
    let b3 = child(&b1, 3);
    tree.add_latest(b3.clone(), 1).unwrap();

    assert_eq!(tree.len(), 4);
    let root_children: Vec<_> = tree.node(tree.root()).children().collect();
    assert_eq!(root_children.len(), 1);
    let branch = root_children[0];
    assert_eq!(branch.block(), &b1);
    assert!(!branch.has_weight());
    let branch_children: Vec<_> = branch.children().collect();
    assert_eq!(branch_children.len(), 2);
    let blocks: HashSet<_> = branch_children.iter().map(|n| n.block().id()).collect();
    assert!(blocks.contains(&b2.id()));
    assert!(blocks.contains(&b3.id()));
  }

  #[test]
  fn coinciding_latest_blocks_share_one_node_with_a_refcount() {
    let genesis = Block::new(None, 0u8);
    let mut tree: CompressedTree<u8, u64> = CompressedTree::new(genesis.clone());
    let b = child(&genesis, 1);
    tree.add_latest(b.clone(), 0).unwrap();
    tree.add_latest(b.clone(), 1).unwrap();

    assert_eq!(tree.len(), 2);
    let root_children: Vec<_> = tree.node(tree.root()).children().collect();
    assert_eq!(root_children.len(), 1);
    assert_eq!(root_children[0].block(), &b);
    assert_eq!(root_children[0].weight_holder_count(), 2);

    // retracting one holder must not compact the node while the other
    // still holds it.
    let b2 = child(&genesis, 2);
    tree.add_latest(b2, 0).unwrap();
    assert_eq!(tree.len(), 3);
    let still_there = tree
      .node(tree.root())
      .children()
      .find(|n| n.block() == &b)
      .expect("b is still validator 1's latest");
    assert!(still_there.has_weight());
    assert_eq!(still_there.weight_holder_count(), 1);
  }

  #[test]
  fn finalization_prunes_to_subtree() {
    let genesis = Block::new(None, 0u8);
    let mut tree: CompressedTree<u8, u64> = CompressedTree::new(genesis.clone());
    let b1 = child(&genesis, 1);
    tree.add_latest(b1.clone(), 0).unwrap();
    let b2 = child(&b1, 2);
    let b2_node = match tree.add_latest(b2.clone(), 0).unwrap() {
      Insertion::Inserted(id) => id,
      Insertion::Ignored => panic!(),
    };
    for v in 1..4u64 {
      let b = child(&b2, 10 + v);
      tree.add_latest(b, v).unwrap();
    }
    assert_eq!(tree.len(), 5); // genesis, b2, and three validators' children of b2

    tree.prune(b2_node).unwrap();
    assert_eq!(tree.len(), 4);
    assert_eq!(tree.node(tree.root()).block(), &b2);
  }

  #[test]
  fn ghost_prefers_heavier_branch() {
    let genesis = Block::new(None, 0u8);
    let mut tree: CompressedTree<u8, u64> = CompressedTree::new(genesis.clone());
    let b0 = child(&genesis, 0);
    let b1 = child(&genesis, 1);
    let b2 = child(&genesis, 2);
    tree.add_latest(b0.clone(), 0).unwrap();
    tree.add_latest(b1.clone(), 1).unwrap();
    tree.add_latest(b2.clone(), 2).unwrap();
    let heavy = child(&b0, 42);
    tree.add_latest(heavy.clone(), 3).unwrap();

    let weights: HashMap<u64, u64> =
      [(b0.id(), 1), (b1.id(), 1), (b2.id(), 1), (heavy.id(), 100)].into_iter().collect();
    let head = tree.find_head(|b| *weights.get(&b.id()).unwrap_or(&0));
    assert_eq!(head.block(), &heavy);
  }

  #[test]
  fn retraction_round_trip_restores_structure() {
    let genesis = Block::new(None, 0u8);
    let mut tree: CompressedTree<u8, u64> = CompressedTree::new(genesis.clone());
    let before = tree.len();
    let b = child(&genesis, 1);
    tree.add_latest(b, 0).unwrap();
    // retract by replacing validator 0's latest with the genesis's sibling-free
    // chain collapsed back down: reinsert a different branch for validator 0
    // that does not build on the removed block, forcing the old leaf to be
    // fully detached with no surviving interior split.
    let b2 = child(&genesis, 2);
    tree.add_latest(b2, 0).unwrap();
    assert_eq!(tree.len(), before + 1);
  }

  #[test]
  fn size_bound_under_random_stress() {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    let genesis = Block::new(None, 0u32);
    let mut tree: CompressedTree<u32, u64> = CompressedTree::new(genesis.clone());
    let mut latest: HashMap<u64, Block<u32>> =
      [0, 1, 2].into_iter().map(|v| (v, genesis.clone())).collect();
    let mut rng = StdRng::seed_from_u64(7);
    for step in 0..1000u32 {
      let parent_validator = rng.gen_range(0..3u64);
      let parent = latest[&parent_validator].clone();
      let assignee = rng.gen_range(0..3u64);
      let block = child(&parent, step);
      tree.add_latest(block.clone(), assignee).unwrap();
      latest.insert(assignee, block);
      assert!(tree.len() <= 2 * 3 - 1, "size bound violated at step {step}: {}", tree.len());
    }
  }
}
