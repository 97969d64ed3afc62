//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;
/// Smallest possible serialized transaction output (8-byte value, empty script).
pub const MIN_TX_OUT_SIZE: u32 = 9;
/// Upper bound on outputs a single block can create.
pub const MAX_OUTPUTS_PER_BLOCK: u32 = MAX_BLOCK_SIZE / MIN_TX_OUT_SIZE;
/// Coinbase transaction outputs can only be spent after this number of new blocks.
pub const COINBASE_MATURITY: i32 = 100;
/// Blocks older than this many seconds in the future are rejected.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks whose timestamps make up median-time-past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Lock times below this are block heights, above are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Interpret sequence numbers as relative lock-time constraints (BIP68).
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
/// If set, the input's sequence number carries no relative lock-time meaning.
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
/// If set, the relative lock-time is in units of 512 seconds, otherwise blocks.
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Versions below these are rejected once the corresponding soft fork is enforced.
pub const BIP34_MIN_BLOCK_VERSION: i32 = 2;
pub const BIP66_MIN_BLOCK_VERSION: i32 = 3;
pub const BIP65_MIN_BLOCK_VERSION: i32 = 4;
