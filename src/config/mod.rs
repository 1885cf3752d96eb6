//! Configuration constants for file layout, pointer encoding, and cache
//! sizing.

mod constants;

pub use constants::*;
