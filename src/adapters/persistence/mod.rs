//! Persistence Adapters - JSONL-based File Storage
//!
//! Implements the StateRepository port using append-only JSONL files
//! for trade logs and atomic JSON snapshots for agent state.
//! No database dependency - lightweight and crash-recoverable.

pub mod repository_impl;
pub mod state;
pub mod trades;

pub use repository_impl::FileRepository;
pub use state::StateStore;
pub use trades::TradeLogger;
