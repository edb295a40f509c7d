//! The layered boundary graph finality estimator.
//!
//! Ported from `cbc_lmd/message.py::LayerStore`: layer 0 is the newest
//! own-message of each validator that still agrees with the candidate
//! block, and each subsequent layer advances a validator past the first
//! of its own messages that acknowledges at least `quorum` weight of the
//! previous layer's members.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::rc::Rc;

use tracing::debug;

use crate::block::Block;
use crate::error::Result;
use crate::message::Message;
use crate::validator_set::ValidatorSet;

type Layer<V, P> = HashMap<V, Rc<Message<V, P>>>;

pub struct LayerStore<'a, V, P> {
  validator_set: &'a ValidatorSet<V, P>,
  quorum: u64,
  layers: Vec<Layer<V, P>>,
}

impl<'a, V, P> LayerStore<'a, V, P>
where
  V: Clone + Eq + Hash + std::fmt::Debug,
{
  /// Builds the full layer stack for `block` against `quorum`.
  pub fn build(validator_set: &'a ValidatorSet<V, P>, block: &Block<P>, quorum: u64) -> Result<Self> {
    let mut store = LayerStore { validator_set, quorum, layers: Vec::new() };

    let layer0 = store.build_first_layer(block)?;
    if layer0.is_empty() {
      debug!("no validator has a message on top of the candidate block; zero layers");
      return Ok(store);
    }
    store.layers.push(layer0);

    loop {
      let prev = store.layers.last().unwrap();
      let next = store.build_next_layer(prev);
      if next.is_empty() {
        break;
      }
      store.layers.push(next);
    }

    Ok(store)
  }

  /// Layer 0: for each validator, the newest own-message that descends
  /// from (or equals) `block`.
  fn build_first_layer(&self, block: &Block<P>) -> Result<Layer<V, P>> {
    let mut layer = Layer::new();
    for view in self.validator_set.views() {
      for msg in view.own_message_by_height().values().rev() {
        if msg.block.height() < block.height() {
          break; // older own-messages can only get further from `block`.
        }
        if &msg.block.prev_at_height(block.height())? == block {
          layer.insert(view.id().clone(), Rc::clone(msg));
          break;
        }
      }
    }
    Ok(layer)
  }

  /// Layer k+1: for each validator in layer k, the first (lowest-height)
  /// own-message from its boundary height onward that acknowledges at
  /// least `quorum` weight of layer k's members.
  fn build_next_layer(&self, prev: &Layer<V, P>) -> Layer<V, P> {
    let mut layer = Layer::new();
    for (validator, boundary) in prev {
      let Some(view) = self.validator_set.view(validator) else { continue };
      for (&height, msg) in view.own_message_by_height().range(boundary.message_height..) {
        let _ = height;
        let acknowledged: u64 = prev
          .iter()
          .filter(|(other, other_boundary)| {
            msg
              .latest_messages
              .get(*other)
              .is_some_and(|seen| seen.message_height >= other_boundary.message_height)
          })
          .map(|(other, _)| self.validator_set.weight(other))
          .sum();

        if acknowledged >= self.quorum {
          layer.insert(validator.clone(), Rc::clone(msg));
          break;
        }
      }
    }
    layer
  }

  /// Number of completed, non-empty layers.
  pub fn layer_count(&self) -> usize {
    self.layers.len()
  }

  pub fn layer(&self, k: usize) -> Option<&Layer<V, P>> {
    self.layers.get(k)
  }

  /// `(2q - W) / (1 - 2^-N)`, `None` if no layer was built (the estimate
  /// is undefined with zero layers).
  pub fn fault_tolerance(&self) -> Option<f64> {
    let n = self.layers.len();
    if n == 0 {
      return None;
    }
    let total_weight = self.validator_set.total_weight() as f64;
    let numerator = 2.0 * self.quorum as f64 - total_weight;
    let denominator = 1.0 - 0.5f64.powi(n as i32);
    Some(numerator / denominator)
  }

  pub fn has_fault_tolerance(&self, t: f64) -> bool {
    self.fault_tolerance().is_some_and(|ft| ft >= t)
  }

  /// Incremental update, ported from `cbc_lmd/message.py::LayerStore.add_message`:
  /// for every validator cited in `message`'s own latest-messages snapshot,
  /// find every layer where that validator has an entry `message` brings
  /// up to date or past; `max_layer` is the highest such layer (0 if none).
  /// If the validators `message` brings up to date at `max_layer` cover at
  /// least `quorum` weight, the sender is promoted to `max_layer + 1`;
  /// otherwise `message` is installed at `max_layer` only if the sender has
  /// no entry there yet.
  pub fn add_message(&mut self, message: Rc<Message<V, P>>) {
    if self.layers.is_empty() {
      self.layers.push(Layer::new());
    }

    let mut vals_at_layer: HashMap<usize, HashSet<V>> = HashMap::new();
    vals_at_layer.entry(0).or_default();

    for (val, latest) in &message.latest_messages {
      for layer_height in (0..self.layers.len()).rev() {
        if let Some(entry) = self.layers[layer_height].get(val) {
          if entry.message_height <= latest.message_height {
            vals_at_layer.entry(layer_height).or_default().insert(val.clone());
          }
        }
      }
    }

    let max_layer = vals_at_layer.keys().copied().max().unwrap_or(0);
    let weight_at_max_layer: u64 = vals_at_layer
      .get(&max_layer)
      .into_iter()
      .flatten()
      .map(|v| self.validator_set.weight(v))
      .sum();

    if weight_at_max_layer >= self.quorum {
      while self.layers.len() <= max_layer + 1 {
        self.layers.push(Layer::new());
      }
      self.layers[max_layer + 1].insert(message.sender.clone(), message);
    } else {
      self.layers[max_layer].entry(message.sender.clone()).or_insert(message);
    }
  }
}
