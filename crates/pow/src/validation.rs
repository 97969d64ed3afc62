use chaind_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

use crate::difficulty::{compact_to_u256, CompactError};

#[derive(Debug)]
pub enum PowError {
    InvalidBits(&'static str),
    HashMismatch,
    Compact(CompactError),
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidBits(message) => write!(f, "{message}"),
            PowError::HashMismatch => write!(f, "proof of work failed"),
            PowError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

/// Checks that `hash` satisfies the target encoded in `bits` and that the
/// target itself is within the network's limit.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::InvalidBits("pow target is zero"));
    }

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    if target > pow_limit {
        return Err(PowError::InvalidBits("pow target above limit"));
    }

    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaind_consensus::{chain_params, Network};
    use chaind_primitives::block::genesis_block;

    #[test]
    fn genesis_satisfies_its_own_target() {
        for network in [Network::Mainnet, Network::Regtest] {
            let params = chain_params(network);
            let genesis = genesis_block(&params.genesis);
            check_proof_of_work(&genesis.hash(), genesis.header.bits, &params.consensus)
                .expect("genesis pow");
        }
    }

    #[test]
    fn rejects_targets_above_limit_and_failing_hashes() {
        let params = chain_params(Network::Mainnet).consensus;
        assert!(matches!(
            check_proof_of_work(&[0u8; 32], 0x207f_ffff, &params),
            Err(PowError::InvalidBits(_))
        ));
        assert!(matches!(
            check_proof_of_work(&[0xffu8; 32], 0x1d00_ffff, &params),
            Err(PowError::HashMismatch)
        ));
        assert!(matches!(
            check_proof_of_work(&[0u8; 32], 0x0080_0000, &params),
            Err(PowError::Compact(CompactError::Negative))
        ));
    }
}
