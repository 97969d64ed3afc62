//! Difficulty and compact target utilities.

use chaind_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyError {
    MissingAncestor(i64),
    Compact(CompactError),
}

impl std::fmt::Display for DifficultyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DifficultyError::MissingAncestor(height) => {
                write!(f, "no ancestor header at height {height}")
            }
            DifficultyError::Compact(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DifficultyError {}

impl From<CompactError> for DifficultyError {
    fn from(err: CompactError) -> Self {
        DifficultyError::Compact(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    // The 0x00800000 bit denotes the sign, so shift the mantissa down a byte.
    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes needed to find a block at `bits`.
///
/// This is `2**256 / (target + 1)`, computed as `~target / (target + 1) + 1`
/// because `2**256` does not fit in 256 bits.
pub fn block_proof(bits: u32) -> U256 {
    let target = match compact_to_u256(bits) {
        Ok(target) => target,
        Err(_) => return U256::zero(),
    };
    if target.is_zero() {
        return U256::zero();
    }
    let one = U256::from(1u64);
    (!target / (target + one)) + one
}

/// Required `bits` for the block after `last`.
///
/// `ancestor` resolves a header on the same branch as `last` by height; it is
/// consulted for the first block of a retarget window and, on networks that
/// allow minimum-difficulty blocks, to find the last real target.
pub fn get_next_work_required(
    last: Option<&HeaderInfo>,
    next_block_time: i64,
    ancestor: &dyn Fn(i64) -> Option<HeaderInfo>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let pow_limit_bits = target_to_compact(&params.pow_limit);
    let Some(last) = last else {
        return Ok(pow_limit_bits);
    };
    let interval = params.difficulty_adjustment_interval();

    if (last.height + 1) % interval != 0 {
        if params.pow_allow_min_difficulty_blocks {
            // A block more than twice the spacing late may use the minimum difficulty.
            if next_block_time > last.time + params.pow_target_spacing * 2 {
                return Ok(pow_limit_bits);
            }
            let mut cursor = *last;
            while cursor.height > 0
                && cursor.height % interval != 0
                && cursor.bits == pow_limit_bits
            {
                cursor = ancestor(cursor.height - 1)
                    .ok_or(DifficultyError::MissingAncestor(cursor.height - 1))?;
            }
            return Ok(cursor.bits);
        }
        return Ok(last.bits);
    }

    let first_height = last.height - (interval - 1);
    let first = ancestor(first_height).ok_or(DifficultyError::MissingAncestor(first_height))?;
    calculate_next_work_required(last, first.time, params)
}

pub fn calculate_next_work_required(
    last: &HeaderInfo,
    first_block_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    let timespan = params.pow_target_timespan;
    let actual = (last.time - first_block_time).clamp(timespan / 4, timespan * 4);

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let current = compact_to_u256(last.bits)?;
    let mut next = mul_div_u256(current, actual as u64, timespan as u64);
    if next > pow_limit {
        next = pow_limit;
    }
    Ok(u256_to_compact(next))
}

fn mul_div_u256(value: U256, mul: u64, div: u64) -> U256 {
    if div == 0 {
        return U256::max_value();
    }
    let div_u = U256::from(div);
    let q = value / div_u;
    let r = value - q * div_u;
    let (q_mul, overflow_q) = q.overflowing_mul(U256::from(mul));
    if overflow_q {
        return U256::max_value();
    }
    let r_mul = r * U256::from(mul);
    let (sum, overflow_sum) = q_mul.overflowing_add(r_mul / div_u);
    if overflow_sum {
        U256::max_value()
    } else {
        sum
    }
}
