//! Instance configuration and the typed events the monitor emits.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One monitored process/log pair, identified by a stable id.
///
/// Immutable for its lifetime; a rediscovered instance replaces the
/// record wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Human-readable instance name.
    pub name: String,
    /// Stable id derived from the name. Filled in from `name` when the
    /// config omits it.
    #[serde(default)]
    pub instance_id: String,
    /// Path to the instance's append-only log file.
    pub log_path: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Window within which repeated simple events escalate.
    #[serde(default = "default_event_window")]
    pub event_window_secs: u64,
    /// Delay before the local key action armed by the first event fires.
    #[serde(default = "default_first_event_delay")]
    pub first_event_delay_secs: u64,
    /// Delay hint for the remote sequence after reaching the hub.
    /// Currently unused: the wire command carries a hardcoded 10.
    #[serde(default = "default_after_hub_delay")]
    pub after_hub_delay_secs: u64,
    /// Delay hint for the remote sequence after warping.
    /// Currently unused: the wire command carries a hardcoded 5.
    #[serde(default = "default_after_warp_delay")]
    pub after_warp_delay_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_event_window() -> u64 {
    30
}

fn default_first_event_delay() -> u64 {
    10
}

fn default_after_hub_delay() -> u64 {
    10
}

fn default_after_warp_delay() -> u64 {
    5
}

impl InstanceConfig {
    /// Create a config with defaults and a derived id.
    pub fn new(name: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let instance_id = instance_id_for(&name);
        Self {
            name,
            instance_id,
            log_path: log_path.into(),
            enabled: true,
            event_window_secs: default_event_window(),
            first_event_delay_secs: default_first_event_delay(),
            after_hub_delay_secs: default_after_hub_delay(),
            after_warp_delay_secs: default_after_warp_delay(),
        }
    }
}

/// Derive the stable instance id from a display name: lowercase with
/// spaces replaced by underscores.
pub fn instance_id_for(name: &str) -> String {
    name.replace(' ', "_").to_lowercase()
}

/// A single pattern detection produced by the correlator for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// A known failure phrase appeared in the line.
    Simple { phrase: &'static str },
    /// The 3-step sequence completed within its window.
    SequenceComplete,
    /// The occurrence threshold was reached within its window.
    ThresholdReached { count: u32 },
}

/// Events raised for the presentation layer.
///
/// The core never depends on presentation state; the runtime fans these
/// out over a broadcast channel and drops them when nobody listens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MonitorEvent {
    InstanceWatched {
        instance_id: String,
        name: String,
    },
    InstanceUnwatched {
        instance_id: String,
    },
    SimpleEventDetected {
        instance_id: String,
        phrase: String,
    },
    SequenceDetected {
        instance_id: String,
    },
    ThresholdReached {
        instance_id: String,
        count: u32,
    },
    EscalationTierChanged {
        instance_id: String,
        tier: u8,
    },
    KeySent {
        instance_id: String,
        key: String,
    },
    RemoteCommandSent {
        instance_id: String,
    },
    ConnectionChanged {
        instance_id: String,
        connected: bool,
    },
}
