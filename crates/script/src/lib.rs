//! Script verification contract, verify flags, and sigop accounting.
//!
//! Script evaluation itself lives behind [`ScriptVerifier`]; everything in
//! this crate is what block validation needs around that call.

pub mod flags;
pub mod opcodes;
pub mod precomputed;
pub mod sigops;
pub mod standard;
pub mod verifier;

pub use flags::ScriptFlags;
pub use precomputed::PrecomputedTxData;
pub use verifier::{AcceptAllVerifier, ScriptCheck, ScriptError, ScriptVerifier};
