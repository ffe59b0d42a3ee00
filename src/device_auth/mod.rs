// Copilot Proxy GUI - GitHub sign-in via the OAuth device authorization grant
// Requests a user code, shows it on a verification surface and polls until a terminal outcome

pub mod flow;
pub mod github;

use crate::credential::CredentialStore;
use async_trait::async_trait;
use flow::{DeviceAuthOutcome, DeviceCodeGrant, DeviceSession, PollReply, PromptStatus, Step};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum DeviceAuthError {
    #[error("failed to get device code: HTTP {status} - {body}")]
    DeviceCodeRequest { status: u16, body: String },
    #[error("authorization server request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected authorization server response: {0}")]
    InvalidResponse(String),
    #[error("failed to show the verification window: {0}")]
    Presentation(String),
}

/// The two endpoints of the authorization server.
#[async_trait]
pub trait AuthServer: Send + Sync {
    /// Issues a device code. Any failure here ends the flow.
    async fn request_device_code(&self) -> Result<DeviceCodeGrant, DeviceAuthError>;

    /// Polls the token endpoint once. Transport problems come back as
    /// [`PollReply::Failed`] so the loop can retry them.
    async fn poll_token(&self, device_code: &str) -> PollReply;
}

/// The modal surface showing the user code.
pub trait PromptSurface: Send + Sync {
    fn set_status(&self, status: &PromptStatus);
    fn close(&self);
}

/// Creates verification surfaces and opens the verification page.
pub trait PromptPresenter: Send + Sync {
    /// Best-effort; failures are logged by the implementation.
    fn open_verification_page(&self, uri: &str);

    /// Shows the code. The surface must call `dismiss` when the user closes it.
    fn present(
        &self,
        session: &DeviceSession,
        dismiss: DismissHandle,
    ) -> Result<Arc<dyn PromptSurface>, DeviceAuthError>;
}

/// Signals that the verification surface went away.
#[derive(Clone)]
pub struct DismissHandle(Arc<watch::Sender<bool>>);

impl DismissHandle {
    pub fn dismiss(&self) {
        self.0.send_replace(true);
    }
}

struct ActivePrompt {
    id: u64,
    surface: Arc<dyn PromptSurface>,
    dismiss: DismissHandle,
}

/// Runs device-flow sessions, at most one at a time.
pub struct DeviceAuthClient {
    server: Arc<dyn AuthServer>,
    store: Arc<CredentialStore>,
    active: Mutex<Option<ActivePrompt>>,
    next_id: AtomicU64,
}

impl DeviceAuthClient {
    pub fn new(server: Arc<dyn AuthServer>, store: Arc<CredentialStore>) -> Self {
        Self {
            server,
            store,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Runs one session to its terminal outcome.
    ///
    /// Only a failed device-code request is returned as an error; everything
    /// after the surface is shown ends in a [`DeviceAuthOutcome`]. A newer call
    /// closes the surface of an older one, which then resolves as canceled.
    pub async fn begin(
        &self,
        presenter: &dyn PromptPresenter,
    ) -> Result<DeviceAuthOutcome, DeviceAuthError> {
        let grant = self.server.request_device_code().await?;
        let mut session = DeviceSession::new(grant);
        tracing::info!(
            "Device code issued, polling every {}s",
            session.interval()
        );

        presenter.open_verification_page(&session.verification_uri);
        self.close_stale();

        let (tx, mut dismissed) = watch::channel(false);
        let dismiss = DismissHandle(Arc::new(tx));
        let surface = presenter.present(&session, dismiss.clone())?;
        surface.set_status(&PromptStatus::waiting());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        *self.lock_active() = Some(ActivePrompt {
            id,
            surface: surface.clone(),
            dismiss,
        });

        let outcome = self.poll(&mut session, &surface, &mut dismissed).await;
        tracing::info!("Device flow finished: {:?}", outcome.status);

        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.id == id) {
            active.take();
        }
        Ok(outcome)
    }

    async fn poll(
        &self,
        session: &mut DeviceSession,
        surface: &Arc<dyn PromptSurface>,
        dismissed: &mut watch::Receiver<bool>,
    ) -> DeviceAuthOutcome {
        let mut delay = session.delay();
        'polling: loop {
            tokio::select! {
                biased;
                _ = wait_dismissed(dismissed) => return DeviceAuthOutcome::canceled(),
                _ = tokio::time::sleep(delay) => {}
            }
            if *dismissed.borrow() {
                return DeviceAuthOutcome::canceled();
            }

            let reply = tokio::select! {
                biased;
                _ = wait_dismissed(dismissed) => return DeviceAuthOutcome::canceled(),
                reply = self.server.poll_token(&session.device_code) => reply,
            };

            let mut step = session.on_reply(reply);
            loop {
                match step {
                    Step::Wait {
                        delay: next,
                        status,
                    } => {
                        surface.set_status(&status);
                        delay = next;
                        continue 'polling;
                    }
                    Step::Persist { token } => step = session.on_persisted(self.persist(&token)),
                    Step::Finish {
                        outcome,
                        status,
                        close_after,
                    } => {
                        surface.set_status(&status);
                        let surface = surface.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(close_after).await;
                            surface.close();
                        });
                        return outcome;
                    }
                }
            }
        }
    }

    fn persist(&self, token: &str) -> Result<PathBuf, String> {
        self.store
            .write(token)
            .map(|()| self.store.token_path())
            .map_err(|e| {
                tracing::error!("Failed to write token: {}", e);
                e.to_string()
            })
    }

    fn close_stale(&self) {
        if let Some(stale) = self.lock_active().take() {
            tracing::info!("Closing previous sign-in window");
            stale.surface.close();
            stale.dismiss.dismiss();
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActivePrompt>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn wait_dismissed(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}
