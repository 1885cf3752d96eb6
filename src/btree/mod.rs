//! # B+Tree
//!
//! The on-disk B+tree engine: node page layout ([`node`]), the tree
//! operations ([`tree`]), and range iteration ([`iter`]).
//!
//! All key comparisons are bytewise lexicographic. Keys are unique;
//! inserting an existing key fails rather than overwriting.

mod iter;
mod node;
mod tree;

pub use iter::RangeIter;
pub use node::{KcPair, KvPair, NodeType, BPT_ORDER};
pub use tree::BpTree;
