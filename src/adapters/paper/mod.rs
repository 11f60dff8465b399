//! Paper Trading Adapters
//!
//! Run the agent end-to-end without a venue: `ReplayFeed` replays
//! recorded opportunities and estimates from JSONL, `PaperTransport`
//! fills every request at its limit price plus slippage.

pub mod replay;
pub mod transport;

pub use replay::{ReplayFeed, ReplayRecord};
pub use transport::PaperTransport;
