// Copilot Proxy GUI - Canonical service state
// Folds supervisor events into one ServiceState and fans every transition out to the tray and window

use crate::supervisor::{StartOutcome, StopOutcome, Supervisor, SupervisorError, SupervisorEvent};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};

pub const RUNNING_COLOR: [u8; 3] = [0x22, 0xc5, 0x5e];
pub const STOPPED_COLOR: [u8; 3] = [0x88, 0x88, 0x88];
pub const ERROR_COLOR: [u8; 3] = [0xef, 0x44, 0x44];

/// Service status for frontend
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Idle,
    /// Only ever shown locally by the UI.
    Starting,
    Running,
    /// Only ever shown locally by the UI.
    Stopping,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub last_error: Option<String>,
    pub last_model_name: String,
}

/// What happened, beyond the new state, for observers that announce it.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Started { pid: u32 },
    Stopped { unexpected: bool },
    Failed { error: String },
}

impl ServiceState {
    /// Applies one supervisor event. Returns `None` when the event changes nothing,
    /// which is the case for the exit that follows a user stop.
    pub fn apply(&mut self, event: &SupervisorEvent) -> Option<Notice> {
        match event {
            SupervisorEvent::Started { pid, model_name } => {
                self.status = ServiceStatus::Running;
                self.pid = Some(*pid);
                self.last_error = None;
                if !model_name.is_empty() {
                    self.last_model_name = model_name.clone();
                }
                Some(Notice::Started { pid: *pid })
            }
            SupervisorEvent::Stopped => {
                self.status = ServiceStatus::Idle;
                self.pid = None;
                Some(Notice::Stopped { unexpected: false })
            }
            SupervisorEvent::Exited {
                unexpected: true, ..
            } => {
                self.status = ServiceStatus::Idle;
                self.pid = None;
                self.last_error = None;
                Some(Notice::Stopped { unexpected: true })
            }
            SupervisorEvent::Exited { .. } => None,
            SupervisorEvent::SpawnFailed { error } => {
                self.status = ServiceStatus::Error;
                self.pid = None;
                self.last_error = Some(error.clone());
                Some(Notice::Failed {
                    error: error.clone(),
                })
            }
        }
    }
}

/// Tray icon colour, tooltip and menu content for one state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrayView {
    pub color: [u8; 3],
    pub tooltip: String,
    pub status_label: String,
    /// Whether the toggle item stops (true) or starts the service.
    pub offers_stop: bool,
}

impl TrayView {
    pub fn of(state: &ServiceState) -> Self {
        let (color, text, label) = match state.status {
            ServiceStatus::Running | ServiceStatus::Stopping => {
                (RUNNING_COLOR, "Running", "● Running")
            }
            ServiceStatus::Error => (ERROR_COLOR, "Error", "✕ Error"),
            ServiceStatus::Idle | ServiceStatus::Starting => {
                (STOPPED_COLOR, "Stopped", "○ Stopped")
            }
        };
        let offers_stop = color == RUNNING_COLOR;

        let mut tooltip = format!("Copilot Proxy - {}", text);
        if offers_stop && !state.last_model_name.is_empty() {
            tooltip.push_str(&format!("\nModel: {}", state.last_model_name));
        }

        Self {
            color,
            tooltip,
            status_label: label.to_string(),
            offers_stop,
        }
    }

    pub fn toggle_label(&self) -> &'static str {
        if self.offers_stop {
            "■ Stop service"
        } else {
            "▶ Start service"
        }
    }
}

/// A view kept in sync with the service state.
pub trait StateObserver: Send + Sync {
    /// Called with a snapshot after every transition.
    fn state_changed(&self, state: &ServiceState, notice: &Notice);

    /// A tray start was requested but no start configuration is known yet.
    fn start_requested(&self) {}
}

/// Arguments of one start request, remembered for tray restarts.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub args: Vec<String>,
    pub model_name: String,
}

/// Owner of the canonical [`ServiceState`].
///
/// The state is written only by [`StateBroadcaster::pump`]; everyone else gets
/// snapshot copies.
pub struct StateBroadcaster {
    supervisor: Arc<Supervisor>,
    state: watch::Sender<ServiceState>,
    last_start: Mutex<Option<StartRequest>>,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
}

impl StateBroadcaster {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            state: watch::Sender::new(ServiceState::default()),
            last_start: Mutex::new(None),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn StateObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn snapshot(&self) -> ServiceState {
        self.state.borrow().clone()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Starts the worker and remembers the request when it spawned a process.
    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome, SupervisorError> {
        let outcome = self
            .supervisor
            .start(request.args.clone(), &request.model_name)
            .await?;
        if !outcome.already_running {
            *self.lock_last_start() = Some(request);
        }
        Ok(outcome)
    }

    pub async fn stop(&self) -> StopOutcome {
        self.supervisor.stop().await
    }

    /// Restarts with the last successful start request. Without one, observers
    /// are asked to run the interactive start flow and `None` is returned.
    pub async fn replay_last_start(&self) -> Result<Option<StartOutcome>, SupervisorError> {
        let remembered = self.lock_last_start().clone();
        match remembered {
            Some(request) => {
                tracing::info!("Restarting proxy with the last start arguments");
                self.start(request).await.map(Some)
            }
            None => {
                tracing::info!("No previous start, asking the window to start the service");
                for observer in self.observers() {
                    observer.start_requested();
                }
                Ok(None)
            }
        }
    }

    /// Applies supervisor events until the channel closes.
    pub async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SupervisorEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(&event);
        }
        tracing::debug!("Supervisor event channel closed");
    }

    fn handle(&self, event: &SupervisorEvent) {
        let mut notice = None;
        self.state.send_if_modified(|state| {
            notice = state.apply(event);
            notice.is_some()
        });
        let Some(notice) = notice else {
            return;
        };

        let snapshot = self.snapshot();
        tracing::debug!("Service state: {:?}", snapshot.status);
        for observer in self.observers() {
            observer.state_changed(&snapshot, &notice);
        }
    }

    fn observers(&self) -> Vec<Arc<dyn StateObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_last_start(&self) -> std::sync::MutexGuard<'_, Option<StartRequest>> {
        self.last_start.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::testing::FakeCipher;
    use crate::config::AppPaths;
    use crate::credential::CredentialStore;
    use crate::supervisor::{ProcessTerminator, WorkerCommand, WorkerResolver};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct ScriptResolver(Option<String>);

    impl WorkerResolver for ScriptResolver {
        fn resolve(&self) -> Result<WorkerCommand, SupervisorError> {
            match &self.0 {
                Some(script) => Ok(WorkerCommand {
                    program: PathBuf::from("sh"),
                    prefix_args: vec!["-c".to_string(), script.clone(), "worker".to_string()],
                    cwd: None,
                }),
                None => Err(SupervisorError::WorkerMissing(PathBuf::from(
                    "/missing/copilot-proxy-server",
                ))),
            }
        }
    }

    struct KillTerminator;

    impl ProcessTerminator for KillTerminator {
        fn terminate(&self, pid: u32) -> std::io::Result<()> {
            std::process::Command::new("kill")
                .arg(pid.to_string())
                .status()
                .map(|_| ())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<(ServiceState, Notice)>>,
        start_requests: AtomicUsize,
    }

    impl StateObserver for RecordingObserver {
        fn state_changed(&self, state: &ServiceState, notice: &Notice) {
            self.seen
                .lock()
                .unwrap()
                .push((state.clone(), notice.clone()));
        }

        fn start_requested(&self) {
            self.start_requests.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        _dir: TempDir,
        broadcaster: Arc<StateBroadcaster>,
        observer: Arc<RecordingObserver>,
        events: mpsc::UnboundedReceiver<SupervisorEvent>,
    }

    fn harness(script: Option<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::new(dir.path().join("data"), &dir.path().join("home"));
        let store = Arc::new(CredentialStore::new(
            paths,
            Arc::new(FakeCipher::available()),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor::new(
            store,
            Arc::new(ScriptResolver(script.map(str::to_string))),
            Arc::new(KillTerminator),
            tx,
        ));
        let broadcaster = Arc::new(StateBroadcaster::new(supervisor));
        let observer = Arc::new(RecordingObserver::default());
        broadcaster.subscribe(observer.clone());
        Harness {
            _dir: dir,
            broadcaster,
            observer,
            events: rx,
        }
    }

    impl Harness {
        async fn deliver_next(&mut self) -> SupervisorEvent {
            let event = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .expect("timed out waiting for supervisor event")
                .expect("event channel closed");
            self.broadcaster.handle(&event);
            event
        }

        fn notices(&self) -> Vec<Notice> {
            self.observer
                .seen
                .lock()
                .unwrap()
                .iter()
                .map(|(_, n)| n.clone())
                .collect()
        }
    }

    fn request(model: &str) -> StartRequest {
        StartRequest {
            args: vec!["start".to_string(), "--port".to_string(), "4399".to_string()],
            model_name: model.to_string(),
        }
    }

    #[test]
    fn reducer_follows_the_service_lifecycle() {
        let mut state = ServiceState::default();
        assert_eq!(state.status, ServiceStatus::Idle);

        let notice = state.apply(&SupervisorEvent::Started {
            pid: 42,
            model_name: "gpt-4.1".to_string(),
        });
        assert_eq!(notice, Some(Notice::Started { pid: 42 }));
        assert_eq!(state.status, ServiceStatus::Running);
        assert_eq!(state.pid, Some(42));
        assert_eq!(state.last_model_name, "gpt-4.1");

        let notice = state.apply(&SupervisorEvent::Exited {
            code: Some(1),
            unexpected: true,
        });
        assert_eq!(notice, Some(Notice::Stopped { unexpected: true }));
        assert_eq!(state.status, ServiceStatus::Idle);
        assert_eq!(state.pid, None);
        assert_eq!(state.last_error, None);
        assert_eq!(state.last_model_name, "gpt-4.1");
    }

    #[test]
    fn exit_after_user_stop_changes_nothing() {
        let mut state = ServiceState::default();
        state.apply(&SupervisorEvent::Started {
            pid: 7,
            model_name: String::new(),
        });
        assert_eq!(
            state.apply(&SupervisorEvent::Stopped),
            Some(Notice::Stopped { unexpected: false })
        );
        let before = state.clone();
        assert_eq!(
            state.apply(&SupervisorEvent::Exited {
                code: None,
                unexpected: false
            }),
            None
        );
        assert_eq!(state, before);
    }

    #[test]
    fn spawn_failure_records_last_error_until_next_start() {
        let mut state = ServiceState::default();
        state.apply(&SupervisorEvent::SpawnFailed {
            error: "bun not found".to_string(),
        });
        assert_eq!(state.status, ServiceStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("bun not found"));

        state.apply(&SupervisorEvent::Started {
            pid: 9,
            model_name: String::new(),
        });
        assert_eq!(state.status, ServiceStatus::Running);
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn state_serializes_for_the_window() {
        let state = ServiceState {
            status: ServiceStatus::Running,
            pid: Some(3),
            last_error: None,
            last_model_name: "claude-sonnet-4".to_string(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["pid"], 3);
        assert_eq!(json["lastModelName"], "claude-sonnet-4");
    }

    #[test]
    fn tray_view_tracks_status() {
        let mut state = ServiceState {
            status: ServiceStatus::Running,
            pid: Some(1),
            last_error: None,
            last_model_name: "gpt-4.1".to_string(),
        };
        let view = TrayView::of(&state);
        assert_eq!(view.color, RUNNING_COLOR);
        assert_eq!(view.tooltip, "Copilot Proxy - Running\nModel: gpt-4.1");
        assert!(view.offers_stop);
        assert_eq!(view.toggle_label(), "■ Stop service");

        state.status = ServiceStatus::Idle;
        let view = TrayView::of(&state);
        assert_eq!(view.color, STOPPED_COLOR);
        assert_eq!(view.tooltip, "Copilot Proxy - Stopped");
        assert_eq!(view.status_label, "○ Stopped");
        assert!(!view.offers_stop);

        state.status = ServiceStatus::Error;
        let view = TrayView::of(&state);
        assert_eq!(view.color, ERROR_COLOR);
        assert_eq!(view.toggle_label(), "▶ Start service");
    }

    #[tokio::test]
    async fn spawn_failure_reaches_observers_as_error() {
        let mut h = harness(None);

        let err = h.broadcaster.start(request("gpt-4.1")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::WorkerMissing(_)));
        h.deliver_next().await;

        let state = h.broadcaster.snapshot();
        assert_eq!(state.status, ServiceStatus::Error);
        assert!(state.last_error.unwrap().contains("/missing/copilot-proxy-server"));
        assert!(matches!(h.notices()[0], Notice::Failed { .. }));

        // A failed start is not remembered for tray restarts.
        assert_eq!(h.broadcaster.replay_last_start().await.unwrap(), None);
        assert_eq!(h.observer.start_requests.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tray_restart_replays_last_successful_start() {
        let mut h = harness(Some("sleep 30"));

        let first = h.broadcaster.start(request("gpt-4.1")).await.unwrap();
        h.deliver_next().await;
        assert_eq!(h.broadcaster.snapshot().pid, Some(first.pid));

        h.broadcaster.stop().await;
        h.deliver_next().await;
        assert_eq!(h.broadcaster.snapshot().status, ServiceStatus::Idle);

        let replayed = h.broadcaster.replay_last_start().await.unwrap().unwrap();
        assert!(!replayed.already_running);
        loop {
            if let SupervisorEvent::Started { model_name, .. } = h.deliver_next().await {
                assert_eq!(model_name, "gpt-4.1");
                break;
            }
        }
        let state = h.broadcaster.snapshot();
        assert_eq!(state.status, ServiceStatus::Running);
        assert_eq!(state.pid, Some(replayed.pid));
        assert_eq!(h.observer.start_requests.load(Ordering::SeqCst), 0);

        h.broadcaster.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pump_reports_crash_as_unexpected_stop() {
        let h = harness(Some("echo up; sleep 0.2; exit 1"));
        let broadcaster = h.broadcaster.clone();
        let pump = tokio::spawn(broadcaster.clone().pump(h.events));

        broadcaster.start(request("")).await.unwrap();
        for _ in 0..400 {
            if h.observer.seen.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let seen = h.observer.seen.lock().unwrap().clone();
        assert!(matches!(seen[0].1, Notice::Started { .. }));
        assert_eq!(seen[1].1, Notice::Stopped { unexpected: true });
        assert_eq!(seen[1].0.status, ServiceStatus::Idle);
        assert_eq!(
            TrayView::of(&broadcaster.snapshot()).tooltip,
            "Copilot Proxy - Stopped"
        );
        assert!(broadcaster
            .supervisor()
            .logs()
            .contains(&"[process exited with code 1]".to_string()));
        pump.abort();
    }
}
