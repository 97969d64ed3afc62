//! The script verification seam.

use chaind_consensus::money::Amount;
use chaind_primitives::transaction::Transaction;

use crate::flags::ScriptFlags;
use crate::precomputed::PrecomputedTxData;

/// Everything needed to check one input against the output it spends.
#[derive(Clone, Copy, Debug)]
pub struct ScriptCheck<'a> {
    pub script_pubkey: &'a [u8],
    pub amount: Amount,
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub flags: ScriptFlags,
    pub precomputed: &'a PrecomputedTxData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// A consensus rule failed; the spending block is invalid.
    Mandatory(String),
    /// Only a policy rule failed.
    NonMandatory(String),
    /// The verifier could not run at all.
    Internal(String),
}

impl ScriptError {
    /// Whether the source of the script should be penalized.
    pub fn is_bannable(&self) -> bool {
        matches!(self, ScriptError::Mandatory(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            ScriptError::Mandatory(reason)
            | ScriptError::NonMandatory(reason)
            | ScriptError::Internal(reason) => reason,
        }
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Mandatory(reason) => {
                write!(f, "mandatory-script-verify-flag-failed ({reason})")
            }
            ScriptError::NonMandatory(reason) => {
                write!(f, "non-mandatory-script-verify-flag ({reason})")
            }
            ScriptError::Internal(reason) => write!(f, "script verifier error: {reason}"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Evaluates input scripts. Implementations are shared across worker threads.
pub trait ScriptVerifier: Send + Sync {
    fn verify(&self, check: &ScriptCheck<'_>) -> Result<(), ScriptError>;
}

impl<T: ScriptVerifier + ?Sized> ScriptVerifier for std::sync::Arc<T> {
    fn verify(&self, check: &ScriptCheck<'_>) -> Result<(), ScriptError> {
        self.as_ref().verify(check)
    }
}

/// Accepts every input. For callers that validate scripts elsewhere.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllVerifier;

impl ScriptVerifier for AcceptAllVerifier {
    fn verify(&self, _check: &ScriptCheck<'_>) -> Result<(), ScriptError> {
        Ok(())
    }
}
