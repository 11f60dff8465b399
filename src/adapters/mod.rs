//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (file I/O, HTTP servers). Each sub-module
//! groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `metrics`: Prometheus metrics export and health checks
//! - `paper`: Replay feed and paper transport for venue-free runs
//! - `persistence`: JSONL trade logging and state snapshots

pub mod metrics;
pub mod paper;
pub mod persistence;
