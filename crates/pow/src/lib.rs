//! Compact targets, header work, and the retarget contract.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, get_next_work_required, CompactError, HeaderInfo};
pub use validation::{check_proof_of_work, PowError};
