//! Consensus constants, parameters, and soft-fork deployment schedule.

pub mod constants;
pub mod deployments;
pub mod money;
pub mod params;
pub mod rewards;

pub use deployments::{Bip9Deployment, DeploymentPos, MAX_VERSION_BITS_DEPLOYMENTS};
pub use params::{
    chain_params, consensus_params, hash256_from_hex, hash256_to_hex, ChainParams, Checkpoint,
    ConsensusParams, GenesisParams, Network,
};
pub use rewards::block_subsidy;

/// 32-byte digest in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
