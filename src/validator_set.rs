//! A registry of validators and their stake, each with its own
//! [`ValidatorView`].
//!
//! This is ambient plumbing rather than a new fork-choice concept: the
//! [`crate::layer::LayerStore`] needs to walk every validator's own
//! message history, which means something has to own one
//! [`ValidatorView`] per validator and their weights. `rensa` keeps the
//! analogous stake table (`HashMap<Pubkey, u64>`) directly on
//! `VolatileState`; here it is split out since both `CompressedTree`
//! (one per validator) and `LayerStore` (one across all validators) need
//! to share it.

use std::collections::HashMap;
use std::hash::Hash;

use crate::block::Block;
use crate::validator::ValidatorView;

pub struct ValidatorSet<V, P> {
  weights: HashMap<V, u64>,
  views: HashMap<V, ValidatorView<V, P>>,
}

impl<V, P> ValidatorSet<V, P>
where
  V: Clone + Eq + Hash + std::fmt::Debug,
{
  pub fn new(weights: HashMap<V, u64>, genesis: Block<P>) -> Self {
    let views = weights
      .keys()
      .cloned()
      .map(|v| (v.clone(), ValidatorView::new(v, genesis.clone())))
      .collect();
    ValidatorSet { weights, views }
  }

  pub fn weight(&self, validator: &V) -> u64 {
    self.weights.get(validator).copied().unwrap_or(0)
  }

  pub fn total_weight(&self) -> u64 {
    self.weights.values().sum()
  }

  pub fn view(&self, validator: &V) -> Option<&ValidatorView<V, P>> {
    self.views.get(validator)
  }

  pub fn view_mut(&mut self, validator: &V) -> Option<&mut ValidatorView<V, P>> {
    self.views.get_mut(validator)
  }

  pub fn validators(&self) -> impl Iterator<Item = &V> {
    self.weights.keys()
  }

  pub fn views(&self) -> impl Iterator<Item = &ValidatorView<V, P>> {
    self.views.values()
  }
}
