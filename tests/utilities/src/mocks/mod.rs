mod broadcaster;
mod client;
mod ledger;
mod signer;
mod time;

pub use broadcaster::MockBroadcaster;
pub use client::{MockClient, MockClientState};
pub use ledger::{MockLedger, MockLedgerError};
pub use signer::MockSigner;
pub use time::{BlockingTime, MockTime};
