//! Conflict resolution for competing revisions of one node.
//!
//! The conflict subsystem is responsible for:
//! 1. **Resolution** -- folding every competing revision into one winner.
//! 2. **Commit** -- promoting the winner and tombstoning the rest in a
//!    single write.

pub mod committer;
pub mod resolver;

pub use committer::ResolutionCommitter;
pub use resolver::{union_children, ConflictResolver, Resolution};
