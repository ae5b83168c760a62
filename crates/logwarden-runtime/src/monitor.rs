//! Instance registry and escalation coordinator.
//!
//! One tailing task per watched instance feeds its correlator; detected
//! events drive the escalation state machine, whose side effects (the
//! delayed local key action, the remote command) run here. Per-instance
//! state sits behind that instance's own mutex so instances never block
//! one another.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use logwarden_core::correlate::Correlator;
use logwarden_core::escalate::{EscalationDecision, EscalationState};
use logwarden_core::types::{Detection, InstanceConfig, MonitorEvent};
use logwarden_tail::LogTailer;

use crate::control::{ControlSignal, Sessions};
use crate::inject::KeyInjector;

/// How often each tailing task polls its log file.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Backoff after a transient tail I/O error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

struct InstanceState {
    enabled: bool,
    correlator: Correlator,
    escalation: EscalationState,
    /// Abort handle for the armed delayed key action, if any.
    pending_action: Option<AbortHandle>,
}

struct InstanceEntry {
    config: InstanceConfig,
    state: Mutex<InstanceState>,
    cancel: CancellationToken,
}

/// The monitoring core: owns per-instance state, tailing tasks, and the
/// escalation side effects.
pub struct Monitor {
    key_to_send: String,
    injector: Arc<dyn KeyInjector>,
    sessions: Arc<Sessions>,
    instances: Mutex<HashMap<String, Arc<InstanceEntry>>>,
    events: broadcast::Sender<MonitorEvent>,
    /// Handle to self for the tasks spawned per instance.
    weak_self: Weak<Monitor>,
}

impl Monitor {
    pub fn new(
        key_to_send: String,
        injector: Arc<dyn KeyInjector>,
        sessions: Arc<Sessions>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new_cyclic(|weak_self| Self {
            key_to_send,
            injector,
            sessions,
            instances: Mutex::new(HashMap::new()),
            events,
            weak_self: weak_self.clone(),
        })
    }

    /// Subscribe to presentation events. Events emitted while nobody
    /// listens are dropped.
    pub fn events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    /// Begin monitoring an instance. Fails silently (logs only) when the
    /// log file does not exist or the instance is already watched.
    pub async fn watch(&self, config: InstanceConfig) {
        if !config.log_path.exists() {
            warn!(
                instance = %config.name,
                path = %config.log_path.display(),
                "cannot watch: log file does not exist"
            );
            return;
        }

        let mut instances = self.instances.lock().await;
        if instances.contains_key(&config.instance_id) {
            debug!(instance_id = %config.instance_id, "already watching");
            return;
        }

        let entry = Arc::new(InstanceEntry {
            state: Mutex::new(InstanceState {
                enabled: config.enabled,
                correlator: Correlator::new(),
                escalation: EscalationState::new(),
                pending_action: None,
            }),
            cancel: CancellationToken::new(),
            config,
        });
        instances.insert(entry.config.instance_id.clone(), Arc::clone(&entry));
        drop(instances);

        // Cursor starts at the current end of file: pre-existing lines
        // are never replayed.
        let tailer = LogTailer::new(entry.config.log_path.clone());
        info!(
            instance = %entry.config.name,
            path = %entry.config.log_path.display(),
            cursor = tailer.cursor(),
            "started watching"
        );

        // new_cyclic guarantees the upgrade while self is alive.
        if let Some(monitor) = self.weak_self.upgrade() {
            let task_entry = Arc::clone(&entry);
            tokio::spawn(async move {
                tail_loop(monitor, task_entry, tailer).await;
            });
        }

        self.emit(MonitorEvent::InstanceWatched {
            instance_id: entry.config.instance_id.clone(),
            name: entry.config.name.clone(),
        });
    }

    /// Stop monitoring: the tail loop exits promptly, the armed action
    /// (if any) is cancelled, and all per-instance state is discarded.
    pub async fn unwatch(&self, instance_id: &str) {
        let Some(entry) = self.instances.lock().await.remove(instance_id) else {
            return;
        };
        entry.cancel.cancel();
        if let Some(handle) = entry.state.lock().await.pending_action.take() {
            handle.abort();
        }
        info!(instance = %entry.config.name, "stopped watching");
        self.emit(MonitorEvent::InstanceUnwatched {
            instance_id: instance_id.to_owned(),
        });
    }

    pub async fn is_watching(&self, instance_id: &str) -> bool {
        self.instances.lock().await.contains_key(instance_id)
    }

    /// Enable or disable remediation for an instance. Detection keeps
    /// running either way; a disabled instance takes no actions.
    pub async fn set_enabled(&self, instance_id: &str, enabled: bool) {
        let entry = self.instances.lock().await.get(instance_id).cloned();
        if let Some(entry) = entry {
            entry.state.lock().await.enabled = enabled;
        }
    }

    /// Stop all tailing tasks and discard state.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.instances.lock().await.keys().cloned().collect();
        for id in ids {
            self.unwatch(&id).await;
        }
    }

    /// Consume control-channel signals for the monitor's lifetime.
    pub async fn run_signal_loop(
        self: Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<ControlSignal>,
    ) {
        while let Some(signal) = signals.recv().await {
            match signal {
                ControlSignal::SequenceComplete { instance_id } => {
                    self.on_remote_sequence_complete(&instance_id).await;
                }
                ControlSignal::ConnectionChanged {
                    instance_id,
                    connected,
                } => {
                    self.emit(MonitorEvent::ConnectionChanged {
                        instance_id,
                        connected,
                    });
                }
            }
        }
    }

    /// The peer reported the special sequence finished: send the key once
    /// immediately and drop back to idle, cancelling any armed action.
    pub async fn on_remote_sequence_complete(&self, instance_id: &str) {
        let entry = self.instances.lock().await.get(instance_id).cloned();
        let Some(entry) = entry else {
            debug!(instance_id, "sequence complete for unknown instance");
            return;
        };

        info!(
            instance = %entry.config.name,
            "remote sequence complete, sending final key and resetting"
        );
        {
            let mut state = entry.state.lock().await;
            if let Some(handle) = state.pending_action.take() {
                handle.abort();
            }
            state.escalation.reset();
        }
        self.send_key(&entry).await;
        self.emit(MonitorEvent::EscalationTierChanged {
            instance_id: instance_id.to_owned(),
            tier: 0,
        });
    }

    /// Run one log line through the instance's correlator and apply any
    /// resulting detections.
    async fn process_line(
        &self,
        entry: &Arc<InstanceEntry>,
        line: &str,
        now: DateTime<Utc>,
    ) {
        let detections = { entry.state.lock().await.correlator.observe(line, now) };
        for detection in detections {
            match detection {
                Detection::Simple { phrase } => self.on_simple_event(entry, phrase, now).await,
                Detection::SequenceComplete => self.on_sequence_detected(entry).await,
                Detection::ThresholdReached { count } => {
                    info!(
                        instance = %entry.config.name,
                        count,
                        "occurrence threshold reached"
                    );
                    self.emit(MonitorEvent::ThresholdReached {
                        instance_id: entry.config.instance_id.clone(),
                        count,
                    });
                }
            }
        }
    }

    async fn on_simple_event(
        &self,
        entry: &Arc<InstanceEntry>,
        phrase: &'static str,
        now: DateTime<Utc>,
    ) {
        info!(instance = %entry.config.name, phrase, "event detected");
        self.emit(MonitorEvent::SimpleEventDetected {
            instance_id: entry.config.instance_id.clone(),
            phrase: phrase.to_owned(),
        });

        let mut state = entry.state.lock().await;
        if !state.enabled {
            return;
        }

        let window = chrono::Duration::seconds(entry.config.event_window_secs as i64);
        let decision = state.escalation.on_simple_event(window, now);
        let tier = state.escalation.tier();

        match decision {
            EscalationDecision::ArmLocalAction => {
                let delay = Duration::from_secs(entry.config.first_event_delay_secs);
                info!(
                    instance = %entry.config.name,
                    delay_secs = entry.config.first_event_delay_secs,
                    "first event in window, arming delayed key action"
                );
                if let Some(monitor) = self.weak_self.upgrade() {
                    let action_entry = Arc::clone(entry);
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        monitor.fire_delayed_action(&action_entry).await;
                    });
                    state.pending_action = Some(handle.abort_handle());
                }
            }
            EscalationDecision::DispatchRemoteCommand => {
                info!(
                    instance = %entry.config.name,
                    "second event in window, dispatching remote command"
                );
                drop(state);
                if self
                    .sessions
                    .send_run_sequence(&entry.config.instance_id)
                    .await
                {
                    self.emit(MonitorEvent::RemoteCommandSent {
                        instance_id: entry.config.instance_id.clone(),
                    });
                }
            }
            EscalationDecision::SoftReset => {
                // Back to tier 1 without re-arming the delayed action.
                info!(
                    instance = %entry.config.name,
                    "repeat event in window, resetting to tier 1"
                );
            }
        }

        self.emit(MonitorEvent::EscalationTierChanged {
            instance_id: entry.config.instance_id.clone(),
            tier,
        });
    }

    /// The correlator's 3-step sequence completed: send the key now.
    /// Escalation state is untouched.
    async fn on_sequence_detected(&self, entry: &Arc<InstanceEntry>) {
        info!(instance = %entry.config.name, "kill sequence detected");
        self.emit(MonitorEvent::SequenceDetected {
            instance_id: entry.config.instance_id.clone(),
        });

        let enabled = entry.state.lock().await.enabled;
        if enabled {
            self.send_key(entry).await;
        }
    }

    /// The tier-1 delayed action firing. Checked against `enabled` at
    /// fire time, not arm time.
    async fn fire_delayed_action(&self, entry: &Arc<InstanceEntry>) {
        let enabled = {
            let mut state = entry.state.lock().await;
            state.pending_action = None;
            state.enabled
        };
        if !enabled {
            debug!(
                instance = %entry.config.name,
                "instance disabled, skipping delayed key action"
            );
            return;
        }
        self.send_key(entry).await;
    }

    async fn send_key(&self, entry: &InstanceEntry) {
        let instance_id = &entry.config.instance_id;
        if self.injector.try_send_key(instance_id, &self.key_to_send) {
            info!(
                instance = %entry.config.name,
                key = %self.key_to_send,
                "sent key"
            );
            self.emit(MonitorEvent::KeySent {
                instance_id: instance_id.clone(),
                key: self.key_to_send.clone(),
            });
        } else {
            warn!(
                instance = %entry.config.name,
                "no window for instance, key not sent"
            );
        }
    }

    #[cfg(test)]
    async fn entry(&self, instance_id: &str) -> Option<Arc<InstanceEntry>> {
        self.instances.lock().await.get(instance_id).cloned()
    }
}

/// Poll the log file for the instance's lifetime. Transient errors back
/// off and retry; cancellation exits promptly.
async fn tail_loop(monitor: Arc<Monitor>, entry: Arc<InstanceEntry>, mut tailer: LogTailer) {
    loop {
        tokio::select! {
            _ = entry.cancel.cancelled() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        match tailer.poll_new_lines() {
            Ok(lines) => {
                for line in lines {
                    monitor.process_line(&entry, &line, Utc::now()).await;
                }
            }
            Err(e) => {
                warn!(
                    instance = %entry.config.name,
                    error = %e,
                    "tail poll failed, backing off"
                );
                tokio::select! {
                    _ = entry.cancel.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!(instance = %entry.config.name, "tail loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use logwarden_core::correlate::{
        SEQUENCE_STEP1, SEQUENCE_STEP2, SEQUENCE_STEP3, SIMPLE_EVENT_PHRASES,
    };
    use std::io::Write;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct RecordingInjector {
        sent: StdMutex<Vec<(String, String)>>,
    }

    impl RecordingInjector {
        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().expect("lock").clone()
        }
    }

    impl KeyInjector for RecordingInjector {
        fn try_send_key(&self, instance_id: &str, key: &str) -> bool {
            self.sent
                .lock()
                .expect("lock")
                .push((instance_id.to_owned(), key.to_owned()));
            true
        }
    }

    struct Harness {
        monitor: Arc<Monitor>,
        injector: Arc<RecordingInjector>,
        sessions: Arc<Sessions>,
        _signals: mpsc::UnboundedReceiver<ControlSignal>,
        _dir: tempfile::TempDir,
        log_path: std::path::PathBuf,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let sessions = Sessions::new(tx);
        let injector = Arc::new(RecordingInjector::default());
        let monitor = Monitor::new(
            "G".to_owned(),
            Arc::clone(&injector) as Arc<dyn KeyInjector>,
            Arc::clone(&sessions),
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("latest.log");
        std::fs::write(&log_path, "").expect("create log");
        Harness {
            monitor,
            injector,
            sessions,
            _signals: rx,
            _dir: dir,
            log_path,
        }
    }

    fn instance(h: &Harness, name: &str) -> InstanceConfig {
        let mut config = InstanceConfig::new(name, h.log_path.clone());
        // Immediate delayed actions keep tests fast.
        config.first_event_delay_secs = 0;
        config
    }

    async fn recv_event(
        events: &mut broadcast::Receiver<MonitorEvent>,
        want: impl Fn(&MonitorEvent) -> bool,
    ) -> MonitorEvent {
        timeout(RECV_TIMEOUT, async {
            loop {
                let event = events.recv().await.expect("event stream open");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event before timeout")
    }

    #[tokio::test]
    async fn watch_requires_existing_log_file() {
        let h = harness();
        let config = InstanceConfig::new("Ghost", h._dir.path().join("missing.log"));
        h.monitor.watch(config).await;
        assert!(!h.monitor.is_watching("ghost").await);
    }

    #[tokio::test]
    async fn watch_twice_is_a_no_op() {
        let h = harness();
        h.monitor.watch(instance(&h, "Alt One")).await;
        h.monitor.watch(instance(&h, "Alt One")).await;
        assert!(h.monitor.is_watching("alt_one").await);
        h.monitor.unwatch("alt_one").await;
        assert!(!h.monitor.is_watching("alt_one").await);
    }

    #[tokio::test]
    async fn appended_event_line_is_detected_via_tailing() {
        let h = harness();
        let mut events = h.monitor.events();
        h.monitor.watch(instance(&h, "Alt One")).await;

        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&h.log_path)
            .expect("open");
        writeln!(f, "[12:00:01] [Client thread/INFO]: {}", SIMPLE_EVENT_PHRASES[0]).expect("write");

        let event = recv_event(&mut events, |e| {
            matches!(e, MonitorEvent::SimpleEventDetected { .. })
        })
        .await;
        assert_eq!(
            event,
            MonitorEvent::SimpleEventDetected {
                instance_id: "alt_one".to_owned(),
                phrase: SIMPLE_EVENT_PHRASES[0].to_owned(),
            }
        );

        // First event in a fresh window arms the (zero-delay) local
        // action, which lands as a key press.
        recv_event(&mut events, |e| matches!(e, MonitorEvent::KeySent { .. })).await;
        assert_eq!(h.injector.sent(), vec![("alt_one".to_owned(), "G".to_owned())]);

        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn preexisting_log_lines_are_not_replayed() {
        let h = harness();
        std::fs::write(
            &h.log_path,
            format!("old {}\n", SIMPLE_EVENT_PHRASES[0]),
        )
        .expect("seed log");

        let mut events = h.monitor.events();
        h.monitor.watch(instance(&h, "Alt One")).await;

        // Give the tail loop a few polls; nothing may surface.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        loop {
            match events.try_recv() {
                Ok(MonitorEvent::InstanceWatched { .. }) => continue,
                Ok(other) => panic!("unexpected event from pre-existing content: {other:?}"),
                Err(_) => break,
            }
        }

        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn second_event_in_window_dispatches_remote_command() {
        let h = harness();
        h.monitor.watch(instance(&h, "Alt One")).await;
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        // Register a real control session for the instance.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let shutdown = CancellationToken::new();
        tokio::spawn(crate::control::serve(
            listener,
            Arc::clone(&h.sessions),
            shutdown.clone(),
        ));
        let mut peer = TcpStream::connect(addr).await.expect("connect");
        peer.write_all(
            serde_json::json!({"type": "status", "instanceId": "alt_one"})
                .to_string()
                .as_bytes(),
        )
        .await
        .expect("write");
        let mut buf = vec![0u8; 1024];
        let n = peer.read(&mut buf).await.expect("ack");
        assert!(n > 0);

        let mut events = h.monitor.events();
        let t0 = Utc::now();
        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], t0)
            .await;
        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[1], t0 + chrono::Duration::seconds(5))
            .await;

        recv_event(&mut events, |e| {
            matches!(e, MonitorEvent::RemoteCommandSent { .. })
        })
        .await;

        let n = timeout(RECV_TIMEOUT, peer.read(&mut buf))
            .await
            .expect("command before timeout")
            .expect("read");
        let command: serde_json::Value = serde_json::from_slice(&buf[..n]).expect("json");
        assert_eq!(command["type"], "runSpecialSequence");
        assert_eq!(command["instanceId"], "alt_one");

        assert_eq!(entry.state.lock().await.escalation.tier(), 2);

        shutdown.cancel();
        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn remote_command_without_session_is_dropped() {
        let h = harness();
        h.monitor.watch(instance(&h, "Alt One")).await;
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        let mut events = h.monitor.events();
        let t0 = Utc::now();
        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], t0)
            .await;
        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], t0 + chrono::Duration::seconds(5))
            .await;

        // Tier still escalates, but no RemoteCommandSent event appears.
        assert_eq!(entry.state.lock().await.escalation.tier(), 2);
        recv_event(&mut events, |e| {
            matches!(e, MonitorEvent::EscalationTierChanged { tier: 2, .. })
        })
        .await;
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, MonitorEvent::RemoteCommandSent { .. }),
                "command must be dropped without a session"
            );
        }

        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn third_event_soft_resets_without_rearming_action() {
        let h = harness();
        let mut config = instance(&h, "Alt One");
        // Long delay so an (incorrectly) re-armed action would still be
        // pending and observable.
        config.first_event_delay_secs = 60;
        h.monitor.watch(config).await;
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        let t0 = Utc::now();
        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], t0)
            .await;
        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], t0 + chrono::Duration::seconds(5))
            .await;
        {
            let mut state = entry.state.lock().await;
            assert_eq!(state.escalation.tier(), 2);
            // Drop the armed tier-1 action so a soft-reset re-arm would
            // be visible as a fresh handle.
            if let Some(handle) = state.pending_action.take() {
                handle.abort();
            }
        }

        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], t0 + chrono::Duration::seconds(10))
            .await;
        let state = entry.state.lock().await;
        assert_eq!(state.escalation.tier(), 1);
        assert!(
            state.pending_action.is_none(),
            "soft reset must not re-arm the delayed action"
        );

        drop(state);
        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn kill_sequence_sends_key_immediately() {
        let h = harness();
        h.monitor.watch(instance(&h, "Alt One")).await;
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        let mut events = h.monitor.events();
        let t0 = Utc::now();
        h.monitor.process_line(&entry, SEQUENCE_STEP1, t0).await;
        h.monitor
            .process_line(&entry, SEQUENCE_STEP2, t0 + chrono::Duration::seconds(2))
            .await;
        h.monitor
            .process_line(&entry, SEQUENCE_STEP3, t0 + chrono::Duration::seconds(4))
            .await;

        recv_event(&mut events, |e| {
            matches!(e, MonitorEvent::SequenceDetected { .. })
        })
        .await;
        recv_event(&mut events, |e| matches!(e, MonitorEvent::KeySent { .. })).await;
        assert_eq!(h.injector.sent().len(), 1);
        assert_eq!(
            entry.state.lock().await.escalation.tier(),
            0,
            "kill sequence leaves escalation untouched"
        );

        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn remote_sequence_complete_cancels_pending_action_and_resets() {
        let h = harness();
        let mut config = instance(&h, "Alt One");
        config.first_event_delay_secs = 60;
        h.monitor.watch(config).await;
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], Utc::now())
            .await;
        assert!(entry.state.lock().await.pending_action.is_some());

        let mut events = h.monitor.events();
        h.monitor.on_remote_sequence_complete("alt_one").await;

        recv_event(&mut events, |e| matches!(e, MonitorEvent::KeySent { .. })).await;
        recv_event(&mut events, |e| {
            matches!(e, MonitorEvent::EscalationTierChanged { tier: 0, .. })
        })
        .await;

        let state = entry.state.lock().await;
        assert_eq!(state.escalation.tier(), 0);
        assert!(state.pending_action.is_none());
        drop(state);

        // Only the immediate key fired; the armed 60s action is gone.
        assert_eq!(h.injector.sent().len(), 1);

        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_instance_detects_but_takes_no_action() {
        let h = harness();
        h.monitor.watch(instance(&h, "Alt One")).await;
        h.monitor.set_enabled("alt_one", false).await;
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        let mut events = h.monitor.events();
        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], Utc::now())
            .await;

        // Detection still surfaces for presentation.
        recv_event(&mut events, |e| {
            matches!(e, MonitorEvent::SimpleEventDetected { .. })
        })
        .await;

        let state = entry.state.lock().await;
        assert_eq!(state.escalation.tier(), 0, "no escalation while disabled");
        assert!(state.pending_action.is_none());
        drop(state);
        assert!(h.injector.sent().is_empty());

        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn instance_configured_disabled_is_watched_without_actions() {
        let h = harness();
        let mut config = instance(&h, "Alt One");
        config.enabled = false;
        h.monitor.watch(config).await;
        assert!(h.monitor.is_watching("alt_one").await);
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        let mut events = h.monitor.events();
        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], Utc::now())
            .await;

        recv_event(&mut events, |e| {
            matches!(e, MonitorEvent::SimpleEventDetected { .. })
        })
        .await;
        assert_eq!(entry.state.lock().await.escalation.tier(), 0);
        assert!(h.injector.sent().is_empty());

        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_action_respects_enabled_at_fire_time() {
        let h = harness();
        let mut config = instance(&h, "Alt One");
        config.first_event_delay_secs = 1;
        h.monitor.watch(config).await;
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], Utc::now())
            .await;
        // Disable between arm and fire.
        h.monitor.set_enabled("alt_one", false).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(
            h.injector.sent().is_empty(),
            "action armed while enabled must not fire after disable"
        );

        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn unwatch_cancels_pending_action() {
        let h = harness();
        let mut config = instance(&h, "Alt One");
        config.first_event_delay_secs = 1;
        h.monitor.watch(config).await;
        let entry = h.monitor.entry("alt_one").await.expect("entry");

        h.monitor
            .process_line(&entry, SIMPLE_EVENT_PHRASES[0], Utc::now())
            .await;
        h.monitor.unwatch("alt_one").await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(h.injector.sent().is_empty());
        assert!(!h.monitor.is_watching("alt_one").await);
    }
}
