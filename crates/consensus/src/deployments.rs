//! BIP9 version-bits deployments.

/// What block version to use for new blocks (pre versionbits).
pub const LAST_OLD_BLOCK_VERSION: i32 = 4;
/// What bits to set in version for versionbits blocks.
pub const VERSION_BITS_TOP_BITS: i32 = 0x2000_0000;
/// What bitmask determines whether versionbits is in use.
pub const VERSION_BITS_TOP_MASK: i32 = 0xE000_0000_u32 as i32;
/// Total bits available for versionbits.
pub const VERSION_BITS_NUM_BITS: u8 = 29;

pub const MAX_VERSION_BITS_DEPLOYMENTS: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum DeploymentPos {
    TestDummy = 0,
    Csv = 1,
}

pub const ALL_DEPLOYMENTS: [DeploymentPos; MAX_VERSION_BITS_DEPLOYMENTS] =
    [DeploymentPos::TestDummy, DeploymentPos::Csv];

impl DeploymentPos {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            DeploymentPos::TestDummy => "testdummy",
            DeploymentPos::Csv => "csv",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ALL_DEPLOYMENTS
            .iter()
            .copied()
            .find(|pos| pos.name().eq_ignore_ascii_case(value.trim()))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Bip9Deployment {
    /// Bit position to select the particular bit in the block version.
    pub bit: u8,
    /// Start MedianTime for version bits miner confirmation. Can be a date in the past.
    pub start_time: i64,
    /// Timeout/expiry MedianTime for the deployment attempt.
    pub timeout: i64,
}

impl Bip9Deployment {
    pub const fn new(bit: u8, start_time: i64, timeout: i64) -> Self {
        Self {
            bit,
            start_time,
            timeout,
        }
    }

    pub fn mask(&self) -> u32 {
        1u32 << self.bit
    }

    /// True if `version` uses versionbits and sets this deployment's bit.
    pub fn signalled_by(&self, version: i32) -> bool {
        (version & VERSION_BITS_TOP_MASK) == VERSION_BITS_TOP_BITS
            && (version as u32 & self.mask()) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signalling_requires_top_bits() {
        let deployment = Bip9Deployment::new(0, 0, i64::MAX);
        assert!(deployment.signalled_by(VERSION_BITS_TOP_BITS | 1));
        assert!(!deployment.signalled_by(VERSION_BITS_TOP_BITS));
        assert!(!deployment.signalled_by(1));
        assert!(!deployment.signalled_by(0x6000_0001));
    }

    #[test]
    fn parse_deployment_names() {
        assert_eq!(DeploymentPos::parse("CSV"), Some(DeploymentPos::Csv));
        assert_eq!(
            DeploymentPos::parse("testdummy"),
            Some(DeploymentPos::TestDummy)
        );
        assert_eq!(DeploymentPos::parse("segwit"), None);
    }
}
