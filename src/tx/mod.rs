//! Load accounts, nonce management and paced transaction submission

mod nonce;
mod sender;

pub use nonce::{Account, AccountLedger};
pub use sender::RateDispatcher;
