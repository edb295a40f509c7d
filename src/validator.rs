//! Per-validator fork-choice state.
//!
//! A `ValidatorView` ingests messages causally, maintains the
//! latest-message-per-sender table, and wraps a [`CompressedTree`] with
//! only the blocks relevant to the current GHOST computation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::rc::Rc;

use tracing::trace;

use crate::block::Block;
use crate::error::Result;
use crate::message::Message;
use crate::tree::CompressedTree;

/// Owns one validator's view of the fork-choice state: its own compressed
/// tree, the set of messages it has incorporated, the latest message it
/// has seen from every sender, and an index of its own produced messages
/// by height (used by [`crate::layer::LayerStore`]).
pub struct ValidatorView<V, P> {
  own_id: V,
  tree: CompressedTree<P, V>,
  justification: HashSet<Rc<Message<V, P>>>,
  latest_of_sender: HashMap<V, Rc<Message<V, P>>>,
  own_message_by_height: BTreeMap<u64, Rc<Message<V, P>>>,
}

impl<V, P> ValidatorView<V, P>
where
  V: Clone + Eq + Hash + std::fmt::Debug,
{
  pub fn new(own_id: V, genesis: Block<P>) -> Self {
    ValidatorView {
      own_id,
      tree: CompressedTree::new(genesis),
      justification: HashSet::new(),
      latest_of_sender: HashMap::new(),
      own_message_by_height: BTreeMap::new(),
    }
  }

  pub fn id(&self) -> &V {
    &self.own_id
  }

  pub fn tree(&self) -> &CompressedTree<P, V> {
    &self.tree
  }

  pub fn own_message_by_height(&self) -> &BTreeMap<u64, Rc<Message<V, P>>> {
    &self.own_message_by_height
  }

  pub fn latest_of(&self, sender: &V) -> Option<&Rc<Message<V, P>>> {
    self.latest_of_sender.get(sender)
  }

  /// Ingests `message` causally, observing any of its cited
  /// `latest_messages` not yet in `justification` first. Drains an
  /// explicit worklist rather than recursing, since causal depth is
  /// unbounded in principle.
  pub fn observe(&mut self, message: Rc<Message<V, P>>) -> Result<()> {
    let mut pending = vec![message];
    while let Some(msg) = pending.pop() {
      if self.justification.contains(&msg) {
        continue;
      }

      let unresolved: Vec<Rc<Message<V, P>>> = msg
        .latest_messages
        .values()
        .filter(|dep| !self.justification.contains(*dep))
        .cloned()
        .collect();

      if unresolved.is_empty() {
        self.justification.insert(Rc::clone(&msg));
        self.ingest_latest(&msg)?;
      } else {
        pending.push(msg);
        pending.extend(unresolved);
      }
    }
    Ok(())
  }

  fn ingest_latest(&mut self, msg: &Rc<Message<V, P>>) -> Result<()> {
    let is_new_latest = match self.latest_of_sender.get(&msg.sender) {
      Some(existing) => msg.message_height > existing.message_height,
      None => true,
    };

    if is_new_latest {
      self.latest_of_sender.insert(msg.sender.clone(), Rc::clone(msg));
      self.tree.add_latest(msg.block.clone(), msg.sender.clone())?;
      trace!(sender = ?msg.sender, height = msg.message_height, "new latest message");
    }

    if msg.sender == self.own_id {
      self.own_message_by_height.insert(msg.message_height, Rc::clone(msg));
    }
    Ok(())
  }

  /// `tree.find_head(weight).block()`.
  pub fn forkchoice<F>(&self, weight: F) -> Block<P>
  where
    F: Fn(&Block<P>) -> u64,
  {
    self.tree.find_head(weight).block().clone()
  }

  /// Builds a new block on top of the current fork-choice head, wraps it
  /// in a message snapshotting this view's latest-per-sender table, and
  /// self-observes the result.
  pub fn propose<F>(&mut self, weight: F, payload: P) -> Result<Rc<Message<V, P>>>
  where
    F: Fn(&Block<P>) -> u64,
  {
    let parent = self.forkchoice(weight);
    let block = Block::new(Some(parent), payload);
    let prev_message = self.own_message_by_height.values().next_back().cloned();
    let message = Rc::new(Message::new(
      self.own_id.clone(),
      block,
      self.latest_of_sender.clone(),
      prev_message,
    ));
    self.observe(Rc::clone(&message))?;
    Ok(message)
  }
}
