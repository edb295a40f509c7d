use thiserror::Error;

/// Error taxonomy for the fork-choice core.
///
/// `UnrelatedBlock` is deliberately absent from this enum: a block that
/// does not descend from the current root is a silent, recoverable no-op
/// (see [`crate::tree::Insertion::Ignored`]), not a structured failure.
#[derive(Debug, Error)]
pub enum ForkChoiceError {
  /// `Block::prev_at_height` was asked for a height above the block's own.
  #[error(
    "ancestor height {requested} exceeds block height {actual}"
  )]
  AncestorOutOfRange { requested: u64, actual: u64 },

  /// `Block::lca` was asked to compare two blocks that do not derive from
  /// a common skeleton. Callers must only ever compare blocks that share
  /// a genesis.
  #[error("blocks do not share a common ancestor")]
  NoCommonAncestor,

  /// An internal assertion about the compressed tree's shape failed. This
  /// always indicates a bug in this crate, never caller misuse.
  #[error("internal invariant violated: {0}")]
  InvariantViolated(String),
}

pub type Result<T> = std::result::Result<T, ForkChoiceError>;
