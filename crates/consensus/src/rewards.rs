//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ConsensusParams;

const INITIAL_SUBSIDY: Amount = 50 * COIN;

pub fn block_subsidy(height: i32, params: &ConsensusParams) -> Amount {
    if height < 0 || params.subsidy_halving_interval <= 0 {
        return 0;
    }
    let halvings = height / params.subsidy_halving_interval;
    // Shifting by the full width is undefined; the subsidy is gone long before that.
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}
