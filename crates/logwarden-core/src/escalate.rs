//! Tiered escalation state machine, driven solely by simple events.
//!
//! Decisions are pure; the runtime applies their side effects (delayed
//! key press, remote command dispatch). One state per instance,
//! serialized behind that instance's lock.

use chrono::{DateTime, Duration, Utc};

/// What the coordinator should do in response to a simple event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    /// First event in a fresh window: arm the delayed local key action.
    ArmLocalAction,
    /// Second event within the window: dispatch the remote command now.
    DispatchRemoteCommand,
    /// Third or later event within the window: drop back to tier 1
    /// without re-arming the local action. The next in-window event will
    /// dispatch the remote command again.
    SoftReset,
}

/// Escalation tier tracker for one instance.
///
/// Tier 0 = idle, 1 = first event seen, 2 = escalated to remote command.
#[derive(Debug, Clone, Default)]
pub struct EscalationState {
    tier: u8,
    first_event_at: Option<DateTime<Utc>>,
}

impl EscalationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tier(&self) -> u8 {
        self.tier
    }

    /// Apply one simple event and return the action to take.
    pub fn on_simple_event(&mut self, window: Duration, now: DateTime<Utc>) -> EscalationDecision {
        match self.first_event_at {
            Some(first) if now.signed_duration_since(first) <= window => {
                if self.tier == 1 {
                    self.tier = 2;
                    EscalationDecision::DispatchRemoteCommand
                } else {
                    // Tier 2 (or any later event): restart the window at
                    // tier 1. Intentionally does not arm another local
                    // action; only a fresh window does that.
                    self.first_event_at = Some(now);
                    self.tier = 1;
                    EscalationDecision::SoftReset
                }
            }
            _ => {
                self.first_event_at = Some(now);
                self.tier = 1;
                EscalationDecision::ArmLocalAction
            }
        }
    }

    /// Return to idle (sequence completed remotely, or process lost).
    pub fn reset(&mut self) {
        self.tier = 0;
        self.first_event_at = None;
    }
}
