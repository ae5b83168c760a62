//! Key injection seam.
//!
//! Window discovery and synthetic input are platform concerns outside
//! this core; the monitor only ever talks to this trait.

/// Delivers a key press to an instance's foreground window.
pub trait KeyInjector: Send + Sync {
    /// Returns false when no window is known for the instance or
    /// delivery failed.
    fn try_send_key(&self, instance_id: &str, key: &str) -> bool;
}

/// Headless stand-in: logs the key press and reports success. A platform
/// window/input integration replaces this in a desktop deployment.
#[derive(Debug, Default)]
pub struct LoggingKeyInjector;

impl KeyInjector for LoggingKeyInjector {
    fn try_send_key(&self, instance_id: &str, key: &str) -> bool {
        tracing::info!(instance_id, key, "key press requested");
        true
    }
}
