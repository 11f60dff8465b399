//! Use Cases Layer - Application Business Logic
//!
//! Orchestrates domain logic with port interfaces to implement
//! the agent's core workflows.
//!
//! Use cases:
//! - `Ledger`: Positions, cash, reservations, equity and drawdown
//! - `RiskGate`: Drawdown state machine and order admission
//! - `ExecutionCoordinator`: Idempotent submission and reconciliation
//! - `Agent`: The periodic decision cycle

pub mod agent;
pub mod coordinator;
pub mod ledger;
pub mod risk_gate;

pub use agent::{Agent, AgentError, AgentStatus, CycleReport, load_status};
pub use coordinator::{ExecutionCoordinator, ExecutionOutcome, ExecutionPolicy};
pub use ledger::{Fill, HistoryRetention, Ledger, LedgerSnapshot, SharedLedger};
pub use risk_gate::{Admission, GateSnapshot, RiskGate, RiskLimits, RiskState};
