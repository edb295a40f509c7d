//! Block skeleton and skip-list ancestor operations.
//!
//! A [`Block`] is an immutable vertex in a block tree: a parent link, a
//! height, and a sparse skip-list of ancestors at heights `height - 2^i`
//! that together give `O(log h)` ancestor lookup and lowest-common-ancestor
//! computation over an arbitrarily deep tree.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use crate::error::{ForkChoiceError, Result};

/// Number of skip-list entries. 32 suffices for heights up to 2^32.
pub const SKIP_LIST_LEN: usize = 32;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(0);

struct Inner<P> {
  /// Crate-assigned monotonic identity, stamped at construction. Used for
  /// equality/hashing (blocks compare by identity, never payload) and as
  /// the deterministic GHOST tie-break key. Mirrors the `node_counter`
  /// stamp in the original `cbc_lmd` reference implementation.
  id: u64,
  parent: Option<Block<P>>,
  height: u64,
  skip_list: Box<[Option<Block<P>>]>,
  payload: P,
}

/// An immutable vertex of the block skeleton.
///
/// Cheap to clone (an `Rc` bump); blocks compare and hash by identity, not
/// by payload, and may be shared freely across trees and views.
pub struct Block<P>(Rc<Inner<P>>);

impl<P> Clone for Block<P> {
  fn clone(&self) -> Self {
    Block(Rc::clone(&self.0))
  }
}

impl<P> PartialEq for Block<P> {
  fn eq(&self, other: &Self) -> bool {
    self.0.id == other.0.id
  }
}
impl<P> Eq for Block<P> {}

impl<P> Hash for Block<P> {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.0.id.hash(state);
  }
}

impl<P: fmt::Debug> fmt::Debug for Block<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Block")
      .field("id", &self.0.id)
      .field("height", &self.0.height)
      .field("payload", &self.0.payload)
      .finish()
  }
}

impl<P> Block<P> {
  /// Builds a new block on top of `parent` (or a genesis block if `parent`
  /// is `None`), computing its height and skip-list in `O(L)`.
  pub fn new(parent: Option<Block<P>>, payload: P) -> Block<P> {
    let height = parent.as_ref().map_or(0, |p| p.height() + 1);

    let mut skip_list: Vec<Option<Block<P>>> = Vec::with_capacity(SKIP_LIST_LEN);
    for i in 0..SKIP_LIST_LEN {
      let entry = if i == 0 {
        parent.clone()
      } else {
        match &skip_list[i - 1] {
          Some(ancestor) => ancestor.0.skip_list[i - 1].clone(),
          None => None,
        }
      };
      skip_list.push(entry);
    }

    Block(Rc::new(Inner {
      id: NEXT_BLOCK_ID.fetch_add(1, AtomicOrdering::Relaxed),
      parent,
      height,
      skip_list: skip_list.into_boxed_slice(),
      payload,
    }))
  }

  /// Crate-assigned monotonic identity, used as the deterministic GHOST
  /// tie-break key.
  pub fn id(&self) -> u64 {
    self.0.id
  }

  pub fn height(&self) -> u64 {
    self.0.height
  }

  pub fn payload(&self) -> &P {
    &self.0.payload
  }

  pub fn parent(&self) -> Option<&Block<P>> {
    self.0.parent.as_ref()
  }

  fn skip(&self, i: usize) -> Option<&Block<P>> {
    self.0.skip_list[i].as_ref()
  }

  /// Returns the unique ancestor of this block at height `h`.
  ///
  /// Cost is `O(log(height - h))`: each recursive step jumps to the
  /// largest skip-list entry not overshooting `h`, at least halving the
  /// remaining distance.
  pub fn prev_at_height(&self, h: u64) -> Result<Block<P>> {
    if h > self.0.height {
      return Err(ForkChoiceError::AncestorOutOfRange {
        requested: h,
        actual: self.0.height,
      });
    }
    if h == self.0.height {
      return Ok(self.clone());
    }

    let distance = self.0.height - h;
    let k = floor_log2(distance);
    match self.skip(k) {
      Some(ancestor) => ancestor.prev_at_height(h),
      None => Err(ForkChoiceError::InvariantViolated(format!(
        "skip_list[{k}] missing on block at height {} while seeking height {h}",
        self.0.height
      ))),
    }
  }

  /// Returns the deepest common ancestor of `self` and `other`.
  ///
  /// Both blocks must derive from the same skeleton (share a genesis);
  /// otherwise this fails with [`ForkChoiceError::NoCommonAncestor`].
  pub fn lca(&self, other: &Block<P>) -> Result<Block<P>> {
    let min_height = self.0.height.min(other.0.height);
    let a = self.prev_at_height(min_height)?;
    let b = other.prev_at_height(min_height)?;

    if a == b {
      return Ok(a);
    }

    for i in 0..SKIP_LIST_LEN {
      if a.skip(i) == b.skip(i) {
        return if i == 0 {
          a.parent().cloned().ok_or(ForkChoiceError::NoCommonAncestor)
        } else {
          match (a.skip(i - 1), b.skip(i - 1)) {
            (Some(pa), Some(pb)) => pa.lca(pb),
            _ => Err(ForkChoiceError::NoCommonAncestor),
          }
        };
      }
    }

    Err(ForkChoiceError::NoCommonAncestor)
  }
}

fn floor_log2(n: u64) -> usize {
  debug_assert!(n > 0);
  (63 - n.leading_zeros()) as usize
}

/// Wire form is `(parent, payload)`: `id` is crate-assigned and `skip_list`
/// is derived, so neither round-trips. Deserializing rebuilds both via
/// [`Block::new`], same as constructing a block fresh.
#[cfg(feature = "serde")]
impl<P: serde::Serialize> serde::Serialize for Block<P> {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;
    let mut state = serializer.serialize_struct("Block", 2)?;
    state.serialize_field("parent", &self.0.parent)?;
    state.serialize_field("payload", &self.0.payload)?;
    state.end()
  }
}

#[cfg(feature = "serde")]
impl<'de, P: serde::Deserialize<'de>> serde::Deserialize<'de> for Block<P> {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    #[derive(serde::Deserialize)]
    #[serde(bound = "P: serde::Deserialize<'de>")]
    struct Wire<P> {
      parent: Option<Block<P>>,
      payload: P,
    }
    let wire = Wire::deserialize(deserializer)?;
    Ok(Block::new(wire.parent, wire.payload))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn chain(len: u64) -> Vec<Block<u64>> {
    let mut blocks = vec![Block::new(None, 0)];
    for i in 1..len {
      let parent = blocks.last().unwrap().clone();
      blocks.push(Block::new(Some(parent), i));
    }
    blocks
  }

  #[test]
  fn skip_list_correctness() {
    // either skip_list[i] is absent (height < 2^i) or its height is
    // exactly height - 2^i.
    let blocks = chain(200);
    for b in &blocks {
      for i in 0..SKIP_LIST_LEN {
        match b.skip(i) {
          Some(anc) => assert_eq!(anc.height(), b.height() - (1u64 << i)),
          None => assert!(b.height() < (1u64 << i)),
        }
      }
    }
  }

  #[test]
  fn prev_at_height_is_unique_ancestor() {
    let blocks = chain(100);
    let last = blocks.last().unwrap();
    for j in 0..blocks.len() as u64 {
      assert_eq!(last.prev_at_height(j).unwrap(), blocks[j as usize]);
    }
  }

  #[test]
  fn prev_at_height_rejects_future_heights() {
    let blocks = chain(5);
    let err = blocks[2].prev_at_height(3).unwrap_err();
    assert!(matches!(err, ForkChoiceError::AncestorOutOfRange { .. }));
  }

  #[test]
  fn lca_on_a_fork() {
    let trunk = chain(10);
    let fork_point = trunk[5].clone();
    let left = Block::new(Some(fork_point.clone()), 100);
    let left2 = Block::new(Some(left), 101);
    let right = Block::new(Some(fork_point.clone()), 200);

    assert_eq!(left2.lca(&right).unwrap(), fork_point);
    assert_eq!(right.lca(&left2).unwrap(), fork_point);
    assert_eq!(trunk[9].lca(&trunk[3]).unwrap(), trunk[3]);
  }

  #[test]
  fn blocks_compare_by_identity_not_payload() {
    let genesis = Block::new(None, 0u8);
    let a = Block::new(Some(genesis.clone()), 1u8);
    let b = Block::new(Some(genesis), 1u8);
    assert_ne!(a, b);
  }
}
