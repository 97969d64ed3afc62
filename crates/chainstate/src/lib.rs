//! Block index, active chain and UTXO state.

pub mod blockindex;
pub mod candidates;
pub mod coins;
pub mod config;
pub mod filemeta;
pub mod flatfiles;
pub mod metrics;
pub mod state;
pub mod tree;
pub mod undo;
pub mod validation;
pub mod versionbits;
pub mod view;

pub use blockindex::{BlockIndexNode, NodeId};
pub use coins::{Coin, CoinsDb};
pub use config::ChainStateConfig;
pub use state::{ChainState, ChainStateError, ChainTip, FlushMode, VerifyReport};
pub use undo::DisconnectResult;
pub use validation::{HeaderRejection, RejectCode, ValidationError};
pub use versionbits::ThresholdState;
pub use view::{CoinView, CoinsCache};
