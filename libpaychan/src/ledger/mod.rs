pub mod data_objects;
pub mod dummy_impl;
pub mod error;
pub mod submitter;
pub mod traits;
pub mod watcher;

pub use data_objects::{ChannelClaimParams, ChannelCreateParams, ChannelFundParams, SignedLedgerTx, TxEvent};
pub use dummy_impl::DummyLedger;
pub use error::{LedgerError, SubmitError};
pub use submitter::TxSubmitter;
pub use traits::LedgerClient;
pub use watcher::ChannelWatcher;
