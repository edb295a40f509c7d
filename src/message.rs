//! Wire-shape message type.
//!
//! A `Message` is a validator's attestation to a block, carrying a causal
//! snapshot of the latest messages it had seen from every sender at the
//! moment it was produced. Causal predecessors are held directly as
//! `Rc<Message<_>>`, so a message's justification is always reachable from
//! the message itself: it must be delivered before the message is.

use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

use crate::block::Block;

/// A validator's vote for a block, with a causal snapshot of the latest
/// messages it had observed from every sender.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
  feature = "serde",
  serde(bound = "V: serde::Serialize + for<'a> serde::Deserialize<'a>, P: serde::Serialize + for<'a> serde::Deserialize<'a>")
)]
pub struct Message<V, P> {
  pub sender: V,
  pub block: Block<P>,
  /// This validator's own message sequence number: `prev_message.height + 1`,
  /// or 0 for a validator's first message.
  pub message_height: u64,
  /// Causal snapshot: the sender's view of every validator's latest
  /// message at the moment this message was produced.
  pub latest_messages: HashMap<V, Rc<Message<V, P>>>,
  pub prev_message: Option<Rc<Message<V, P>>>,
}

impl<V: Eq + Hash, P> PartialEq for Message<V, P> {
  /// Messages are identified by `(sender, message_height)`: a validator
  /// never produces two messages at the same height.
  fn eq(&self, other: &Self) -> bool {
    self.sender == other.sender && self.message_height == other.message_height
  }
}
impl<V: Eq + Hash, P> Eq for Message<V, P> {}

impl<V: Eq + Hash, P> Hash for Message<V, P> {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.sender.hash(state);
    self.message_height.hash(state);
  }
}

impl<V, P> Message<V, P> {
  pub fn new(
    sender: V,
    block: Block<P>,
    latest_messages: HashMap<V, Rc<Message<V, P>>>,
    prev_message: Option<Rc<Message<V, P>>>,
  ) -> Self {
    let message_height = prev_message.as_ref().map_or(0, |m| m.message_height + 1);
    Message { sender, block, message_height, latest_messages, prev_message }
  }
}
