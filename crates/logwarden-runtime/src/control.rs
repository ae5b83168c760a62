//! TCP control channel: at most one registered session per instance id.
//!
//! Peers connect, register with a `status` message, and from then on
//! receive server-initiated commands. Messages are newline-free JSON
//! objects; one buffered read is treated as one message. Split or
//! coalesced reads are not reassembled, for wire parity with the peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay hints carried by the outbound run command. Fixed on the wire
/// even though per-instance config fields exist; the peer's current
/// protocol expects these exact values.
const AFTER_HUB_SECONDS: u64 = 10;
const AFTER_WARP_SECONDS: u64 = 5;

/// Signals raised by the control channel toward the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// The peer reported the special sequence finished for an instance.
    SequenceComplete { instance_id: String },
    /// A session for the instance was registered or torn down.
    ConnectionChanged {
        instance_id: String,
        connected: bool,
    },
}

struct Session {
    serial: u64,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

/// Registry of active control sessions, shared by all connection tasks
/// and the monitor.
pub struct Sessions {
    map: Mutex<HashMap<String, Session>>,
    next_serial: AtomicU64,
    signals: mpsc::UnboundedSender<ControlSignal>,
}

impl Sessions {
    pub fn new(signals: mpsc::UnboundedSender<ControlSignal>) -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            signals,
        })
    }

    /// Register a connection as the session for an instance id, evicting
    /// and closing any previous session for that id. Returns the serial
    /// identifying this registration.
    async fn register(
        &self,
        instance_id: &str,
        outbound: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> u64 {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut map = self.map.lock().await;
        if let Some(old) = map.insert(
            instance_id.to_owned(),
            Session {
                serial,
                outbound,
                cancel,
            },
        ) {
            info!(instance_id, "replacing existing control session");
            old.cancel.cancel();
        }
        drop(map);

        info!(instance_id, "control session registered");
        let _ = self.signals.send(ControlSignal::ConnectionChanged {
            instance_id: instance_id.to_owned(),
            connected: true,
        });
        serial
    }

    /// Remove the session for `instance_id` if it still belongs to the
    /// given registration. A stale serial (the session was already
    /// replaced) is a no-op, so a dying connection never evicts its
    /// replacement.
    async fn evict_if_serial(&self, instance_id: &str, serial: u64) {
        let mut map = self.map.lock().await;
        if map.get(instance_id).is_some_and(|s| s.serial == serial) {
            map.remove(instance_id);
            drop(map);
            info!(instance_id, "control session disconnected");
            let _ = self.signals.send(ControlSignal::ConnectionChanged {
                instance_id: instance_id.to_owned(),
                connected: false,
            });
        }
    }

    fn raise_sequence_complete(&self, instance_id: &str) {
        let _ = self.signals.send(ControlSignal::SequenceComplete {
            instance_id: instance_id.to_owned(),
        });
    }

    /// Send the `runSpecialSequence` command to the instance's session.
    ///
    /// Dropped silently (returns false) when no session is registered:
    /// no retry, no queuing. A dead session is evicted on failure.
    pub async fn send_run_sequence(&self, instance_id: &str) -> bool {
        let mut map = self.map.lock().await;
        let Some(session) = map.get(instance_id) else {
            debug!(instance_id, "no control session, dropping run command");
            return false;
        };

        let message = json!({
            "type": "runSpecialSequence",
            "instanceId": instance_id,
            "afterHubSeconds": AFTER_HUB_SECONDS,
            "afterWarpSeconds": AFTER_WARP_SECONDS,
        })
        .to_string();

        if session.outbound.send(message).is_ok() {
            true
        } else {
            // Connection task already gone; clean up the stale entry.
            if let Some(session) = map.remove(instance_id) {
                session.cancel.cancel();
            }
            drop(map);
            warn!(instance_id, "control session dead, evicting");
            let _ = self.signals.send(ControlSignal::ConnectionChanged {
                instance_id: instance_id.to_owned(),
                connected: false,
            });
            false
        }
    }

    /// Whether a session is currently registered for the id.
    pub async fn is_registered(&self, instance_id: &str) -> bool {
        self.map.lock().await.contains_key(instance_id)
    }
}

/// Bind the control listener on the loopback port, retrying once on
/// `port + 1`. Returns `None` when both binds fail; the rest of the
/// system keeps running without a control channel.
pub async fn bind_listener(port: u16) -> Option<TcpListener> {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            warn!(port, error = %e, "control channel bind failed, trying alternate port");
            match TcpListener::bind(("127.0.0.1", port + 1)).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    tracing::error!(
                        port = port + 1,
                        error = %e,
                        "control channel unavailable (both binds failed)"
                    );
                    None
                }
            }
        }
    }
}

/// Accept loop: one task per connection, until shutdown.
pub async fn serve(listener: TcpListener, sessions: Arc<Sessions>, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "control channel listening");
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "control connection accepted");
                    let sessions = Arc::clone(&sessions);
                    tokio::spawn(handle_connection(stream, sessions));
                }
                Err(e) => debug!(error = %e, "control accept failed"),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, sessions: Arc<Sessions>) {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let cancel = CancellationToken::new();
    let mut registered: Option<(String, u64)> = None;
    let mut buf = vec![0u8; 4096];

    loop {
        tokio::select! {
            // Evicted by a replacement session for the same instance id.
            _ = cancel.cancelled() => break,
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                if writer.write_all(message.as_bytes()).await.is_err() {
                    break;
                }
            }
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "control read failed");
                        break;
                    }
                };

                let Ok(message) = serde_json::from_slice::<serde_json::Value>(&buf[..n]) else {
                    debug!("ignoring malformed control message");
                    continue;
                };

                match (message["type"].as_str(), message["instanceId"].as_str()) {
                    (Some("status"), Some(instance_id)) => {
                        let serial = sessions
                            .register(instance_id, outbound_tx.clone(), cancel.clone())
                            .await;
                        if let Some((old_id, old_serial)) =
                            registered.replace((instance_id.to_owned(), serial))
                            && old_id != instance_id
                        {
                            sessions.evict_if_serial(&old_id, old_serial).await;
                        }

                        let ack = json!({
                            "type": "statusAck",
                            "instanceId": instance_id,
                        })
                        .to_string();
                        if writer.write_all(ack.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    (Some("sequenceComplete"), Some(instance_id)) => {
                        sessions.raise_sequence_complete(instance_id);
                    }
                    // Unrecognized payloads are silently ignored; the
                    // connection stays open.
                    _ => {}
                }
            }
        }
    }

    if let Some((instance_id, serial)) = registered {
        sessions.evict_if_serial(&instance_id, serial).await;
    }
}
