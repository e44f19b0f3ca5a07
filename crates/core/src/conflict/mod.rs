//! Conflict handling for merges and rebases.
//!
//! The conflict subsystem is responsible for:
//! 1. **Settlement** -- honoring deletions made on our side and replaying
//!    recorded resolutions for everything else.
//! 2. **Merging** -- the no-fast-forward merge step that commits only when
//!    settlement left nothing behind.

pub mod merger;
pub mod resolver;

pub use merger::{merge_with_replay, MergeClassification};
pub use resolver::{settle, Settlement};
