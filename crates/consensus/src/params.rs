//! Consensus parameter definitions.

use crate::deployments::{Bip9Deployment, MAX_VERSION_BITS_DEPLOYMENTS};
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Network::Mainnet),
            "test" | "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub subsidy_halving_interval: i32,
    /// Blocks with these (height, hash) pairs are allowed to violate BIP30.
    pub bip30_exceptions: Vec<Checkpoint>,
    /// Block height and hash at which BIP34 becomes active.
    pub bip34_height: i32,
    pub bip34_hash: Hash256,
    /// Block height at which BIP65 becomes active.
    pub bip65_height: i32,
    /// Block height at which BIP66 becomes active.
    pub bip66_height: i32,
    /// Blocks with timestamps at or after this enforce P2SH.
    pub bip16_switch_time: u32,
    /// Minimum blocks in a retargeting window that must signal for a lock-in.
    pub rule_change_activation_threshold: u32,
    pub miner_confirmation_window: u32,
    pub deployments: [Bip9Deployment; MAX_VERSION_BITS_DEPLOYMENTS],
    pub pow_limit: Hash256,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub pow_target_spacing: i64,
    pub pow_target_timespan: i64,
    pub minimum_chain_work: Hash256,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn deployment(&self, pos: crate::DeploymentPos) -> &Bip9Deployment {
        &self.deployments[pos.index()]
    }

    pub fn is_bip30_exception(&self, height: i32, hash: &Hash256) -> bool {
        self.bip30_exceptions
            .iter()
            .any(|entry| entry.height == height && &entry.hash == hash)
    }

    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|entry| entry.height == height)
    }

    pub fn last_checkpoint_height(&self) -> Option<i32> {
        self.checkpoints.iter().map(|entry| entry.height).max()
    }
}

/// Fields needed to rebuild a network's genesis block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GenesisParams {
    pub time: u32,
    pub nonce: u32,
    pub bits: u32,
    pub version: i32,
    pub reward: Amount,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub genesis: GenesisParams,
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string has invalid length"),
            HexError::InvalidHex => write!(f, "hex string has invalid characters"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex hash into internal byte order.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }

    let padded = format!("{hex:0>64}");
    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Renders an internal-order hash in display order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    let genesis = match network {
        Network::Mainnet => GenesisParams {
            time: 1_231_006_505,
            nonce: 2_083_236_893,
            bits: 0x1d00_ffff,
            version: 1,
            reward: 50 * COIN,
        },
        Network::Testnet => GenesisParams {
            time: 1_296_688_602,
            nonce: 414_098_458,
            bits: 0x1d00_ffff,
            version: 1,
            reward: 50 * COIN,
        },
        Network::Regtest => GenesisParams {
            time: 1_296_688_602,
            nonce: 2,
            bits: 0x207f_ffff,
            version: 1,
            reward: 50 * COIN,
        },
    };
    ChainParams {
        network,
        consensus: consensus_params(network),
        genesis,
    }
}

fn hash(hex: &str) -> Hash256 {
    hash256_from_hex(hex).expect("static hash literal")
}

fn parse_checkpoints(entries: &[(i32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hex)| Checkpoint {
            height: *height,
            hash: hash(hex),
        })
        .collect()
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash(
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        ),
        subsidy_halving_interval: 210_000,
        bip30_exceptions: parse_checkpoints(&[
            (
                91_842,
                "00000000000a4d0a398161ffc163c503763b1f4360639393e0e4c8e300e0caec",
            ),
            (
                91_880,
                "00000000000743f190a18c5577a3c2d2a1f610ae9601ac046a38084ccb7cd721",
            ),
        ]),
        bip34_height: 227_931,
        bip34_hash: hash("000000000000024b89b42a942fe0d9fea3bb44ab7bd1b19115dd6a759c0808b8"),
        bip65_height: 388_381,
        bip66_height: 363_725,
        bip16_switch_time: 1_333_238_400,
        rule_change_activation_threshold: 1916,
        miner_confirmation_window: 2016,
        deployments: [
            Bip9Deployment::new(28, 1_199_145_601, 1_230_767_999),
            Bip9Deployment::new(0, 1_462_060_800, 1_493_596_800),
        ],
        pow_limit: hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_allow_min_difficulty_blocks: false,
        pow_no_retargeting: false,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        minimum_chain_work: hash(
            "0000000000000000000000000000000000000000000000000000000000000000",
        ),
        checkpoints: parse_checkpoints(&[
            (
                11_111,
                "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d",
            ),
            (
                33_333,
                "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6",
            ),
            (
                74_000,
                "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20",
            ),
            (
                105_000,
                "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97",
            ),
            (
                134_444,
                "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe",
            ),
            (
                168_000,
                "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763",
            ),
            (
                193_000,
                "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317",
            ),
            (
                210_000,
                "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e",
            ),
            (
                250_000,
                "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214",
            ),
        ]),
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash(
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        ),
        subsidy_halving_interval: 210_000,
        bip30_exceptions: Vec::new(),
        bip34_height: 21_111,
        bip34_hash: hash("0000000023b3a96d3484e5abb3755c413e7d41500f8e2a5c3f0dd01299cd8ef8"),
        bip65_height: 581_885,
        bip66_height: 330_776,
        bip16_switch_time: 1_333_238_400,
        rule_change_activation_threshold: 1512,
        miner_confirmation_window: 2016,
        deployments: [
            Bip9Deployment::new(28, 1_199_145_601, 1_230_767_999),
            Bip9Deployment::new(0, 1_456_790_400, 1_493_596_800),
        ],
        pow_limit: hash("00000000ffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: false,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        minimum_chain_work: [0u8; 32],
        checkpoints: parse_checkpoints(&[(
            546,
            "000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70",
        )]),
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: hash(
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        ),
        subsidy_halving_interval: 150,
        bip30_exceptions: Vec::new(),
        // Far enough out that version 1 blocks stay valid.
        bip34_height: 100_000_000,
        bip34_hash: [0u8; 32],
        bip65_height: 1351,
        bip66_height: 1251,
        bip16_switch_time: 1_333_238_400,
        rule_change_activation_threshold: 108,
        miner_confirmation_window: 144,
        deployments: [
            Bip9Deployment::new(28, 0, 999_999_999_999),
            Bip9Deployment::new(0, 0, 999_999_999_999),
        ],
        pow_limit: hash("7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"),
        pow_allow_min_difficulty_blocks: true,
        pow_no_retargeting: true,
        pow_target_spacing: 10 * 60,
        pow_target_timespan: 14 * 24 * 60 * 60,
        minimum_chain_work: [0u8; 32],
        checkpoints: parse_checkpoints(&[(
            0,
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
        )]),
    }
}
