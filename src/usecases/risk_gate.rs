//! Risk Gate - Drawdown State Machine and Order Admission
//!
//! Three states driven by the ledger's drawdown from peak equity:
//! - Normal: full caps
//! - Restricted: caps scaled by `restricted_cap_multiplier`
//! - Halted: no new exposure until an explicit reset
//!
//! Restricted recovers to Normal only below `recovery_drawdown`, which sits
//! under `restrict_drawdown` so the gate does not flap around one level.
//! Halted never clears on its own. Closing positions is always permitted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::error::RejectReason;
use crate::domain::kelly::{SizedOrder, SizingRules};
use crate::domain::portfolio::LedgerState;

/// Drawdown thresholds, as fractions of peak equity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLimits {
  /// Normal -> Restricted at or above this drawdown.
  #[serde(default = "default_restrict")]
  pub restrict_drawdown: Decimal,
  /// Any state -> Halted at or above this drawdown.
  #[serde(default = "default_halt")]
  pub halt_drawdown: Decimal,
  /// Restricted -> Normal below this drawdown.
  #[serde(default = "default_recovery")]
  pub recovery_drawdown: Decimal,
  /// Cap scaling applied while Restricted.
  #[serde(default = "default_restricted_multiplier")]
  pub restricted_cap_multiplier: Decimal,
}

fn default_restrict() -> Decimal {
  dec!(0.10)
}

fn default_halt() -> Decimal {
  dec!(0.15)
}

fn default_recovery() -> Decimal {
  dec!(0.05)
}

fn default_restricted_multiplier() -> Decimal {
  dec!(0.5)
}

impl Default for RiskLimits {
  fn default() -> Self {
    Self {
      restrict_drawdown: default_restrict(),
      halt_drawdown: default_halt(),
      recovery_drawdown: default_recovery(),
      restricted_cap_multiplier: default_restricted_multiplier(),
    }
  }
}

/// Gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskState {
  #[default]
  Normal,
  Restricted,
  Halted,
}

impl RiskState {
  pub const fn label(self) -> &'static str {
    match self {
      Self::Normal => "normal",
      Self::Restricted => "restricted",
      Self::Halted => "halted",
    }
  }

  /// Numeric encoding for the risk state gauge.
  pub const fn as_gauge(self) -> i64 {
    match self {
      Self::Normal => 0,
      Self::Restricted => 1,
      Self::Halted => 2,
    }
  }
}

impl std::fmt::Display for RiskState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.label())
  }
}

/// Persisted gate state. A halt survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GateSnapshot {
  pub state: RiskState,
  pub halt_reason: Option<String>,
  pub changed_at: Option<DateTime<Utc>>,
}

/// An order cleared for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmittedOrder {
  pub order: SizedOrder,
  /// Gate state at admission.
  pub gate_state: RiskState,
  pub admitted_at: DateTime<Utc>,
}

/// Gate decision for one sized order.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
  Admitted(AdmittedOrder),
  Rejected(RejectReason),
}

/// The risk gate. Owned by the agent task; not shared.
#[derive(Debug, Clone)]
pub struct RiskGate {
  limits: RiskLimits,
  sizing: SizingRules,
  state: RiskState,
  halt_reason: Option<String>,
  changed_at: Option<DateTime<Utc>>,
}

impl RiskGate {
  /// Create a gate in the Normal state.
  pub fn new(limits: RiskLimits, sizing: SizingRules) -> Self {
    Self {
      limits,
      sizing,
      state: RiskState::Normal,
      halt_reason: None,
      changed_at: None,
    }
  }

  /// Resume from a persisted state.
  pub fn restore(&mut self, snapshot: GateSnapshot) {
    if snapshot.state == RiskState::Halted {
      warn!(
        reason = snapshot.halt_reason.as_deref().unwrap_or("unknown"),
        "Risk gate restored in halted state"
      );
    }
    self.state = snapshot.state;
    self.halt_reason = snapshot.halt_reason;
    self.changed_at = snapshot.changed_at;
  }

  pub fn snapshot(&self) -> GateSnapshot {
    GateSnapshot {
      state: self.state,
      halt_reason: self.halt_reason.clone(),
      changed_at: self.changed_at,
    }
  }

  pub fn state(&self) -> RiskState {
    self.state
  }

  pub fn is_halted(&self) -> bool {
    self.state == RiskState::Halted
  }

  pub fn halt_reason(&self) -> Option<&str> {
    self.halt_reason.as_deref()
  }

  pub fn limits(&self) -> &RiskLimits {
    &self.limits
  }

  /// Feed the latest ledger view through the state machine.
  pub fn observe(&mut self, ledger: &LedgerState) -> RiskState {
    let drawdown = ledger.drawdown;
    let next = match self.state {
      RiskState::Halted => RiskState::Halted,
      _ if drawdown >= self.limits.halt_drawdown => RiskState::Halted,
      RiskState::Normal if drawdown >= self.limits.restrict_drawdown => RiskState::Restricted,
      RiskState::Restricted if drawdown < self.limits.recovery_drawdown => RiskState::Normal,
      current => current,
    };

    if next != self.state {
      if next == RiskState::Halted {
        self.halt_reason = Some(format!(
          "drawdown {drawdown} reached halt threshold {}",
          self.limits.halt_drawdown
        ));
        error!(
          drawdown = %drawdown,
          threshold = %self.limits.halt_drawdown,
          equity = %ledger.equity,
          peak = %ledger.peak_equity,
          "Risk gate HALTED"
        );
      } else {
        info!(
          from = %self.state,
          to = %next,
          drawdown = %drawdown,
          "Risk gate transition"
        );
      }
      self.state = next;
      self.changed_at = Some(Utc::now());
    }
    self.state
  }

  /// Halt immediately (ledger inconsistency, operator request).
  pub fn force_halt(&mut self, reason: impl Into<String>) {
    let reason = reason.into();
    error!(reason = %reason, "Risk gate forced to halt");
    self.state = RiskState::Halted;
    self.halt_reason = Some(reason);
    self.changed_at = Some(Utc::now());
  }

  /// Explicit operator reset: Halted -> Normal.
  ///
  /// The gate only clears its own state. Callers rebase the ledger's
  /// drawdown reference (`Ledger::rebase_peak`) first, otherwise the next
  /// `observe` sees the old drawdown and halts again.
  pub fn reset(&mut self) {
    if self.state != RiskState::Normal {
      warn!(from = %self.state, "Risk gate reset to normal");
    }
    self.state = RiskState::Normal;
    self.halt_reason = None;
    self.changed_at = Some(Utc::now());
  }

  /// Sizing rules in force for the current state.
  pub fn effective_sizing(&self) -> SizingRules {
    match self.state {
      RiskState::Restricted => self
        .sizing
        .with_scaled_caps(self.limits.restricted_cap_multiplier),
      _ => self.sizing.clone(),
    }
  }

  /// Decide whether a sized order may proceed to execution.
  pub fn admit(&self, order: SizedOrder, ledger: &LedgerState) -> Admission {
    if self.state == RiskState::Halted {
      return Admission::Rejected(RejectReason::HaltedState);
    }
    if order.is_capped_to_zero() {
      return Admission::Rejected(RejectReason::CappedToZero);
    }

    let rules = self.effective_sizing();
    let stake = order.capped_stake;
    if stake > rules.per_market_headroom(ledger, order.market()) {
      return Admission::Rejected(RejectReason::PerMarketExposureExceeded);
    }
    if stake > rules.aggregate_headroom(ledger) {
      return Admission::Rejected(RejectReason::AggregateExposureExceeded);
    }

    Admission::Admitted(AdmittedOrder {
      order,
      gate_state: self.state,
      admitted_at: Utc::now(),
    })
  }
}
