//! Zamfir, V., et al. "Introducing the minimal CBC Casper family of
//! consensus protocols." Fork-choice core of a CBC-Casper / LMD-GHOST
//! style consensus layer: a compressed latest-message tree for GHOST head
//! selection, and a layered boundary graph for finality estimation.
//!
//! This crate is intentionally narrow. It assumes it is fed validated
//! messages in any order consistent with causal delivery, and exposes
//! pure data structures plus in-memory mutation. Network transport,
//! signature verification, persistence, and visualization are external
//! collaborators.

mod block;
mod error;
mod layer;
mod message;
mod tree;
mod validator;
mod validator_set;

pub use block::{Block, SKIP_LIST_LEN};
pub use error::{ForkChoiceError, Result};
pub use layer::LayerStore;
pub use message::Message;
pub use tree::{CompressedTree, Insertion, Node, NodeId};
pub use validator::ValidatorView;
pub use validator_set::ValidatorSet;
