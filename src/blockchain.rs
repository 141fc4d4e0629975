// Thin re-export module: implementation is in `blockchain/core.rs`, split by
// responsibility (merkle commitment, block structure, validation,
// fork-choice, consensus state).

pub mod core;
pub use self::core::*;
