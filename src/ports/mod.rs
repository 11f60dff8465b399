//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the decision core requires
//! from the outside world. Adapters implement these traits; the core
//! only consumes their typed results.
//!
//! Port categories:
//! - `SnapshotProvider`: current tradable opportunities
//! - `ProbabilityEstimator`: true-probability / expected-value estimates
//! - `ExecutionTransport`: request submission and status reconciliation
//! - `StateRepository`: ledger snapshots and trade history

pub mod estimator;
pub mod execution;
pub mod repository;
pub mod snapshot;
