//! Client-side chat orchestration: one outstanding request per mode, streamed text
//! drafts, rotating placeholders for slow artifacts, and retry on model cold starts.

pub mod backend;
pub mod session;
pub mod store;

use crate::constants::*;
use crate::hardening::{estimated_wait, RetryPolicy};
use crate::types::*;
use backend::ChatBackend;
use futures_util::StreamExt;
use session::RequestSession;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use store::{ConversationStore, Phase};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub rotation_interval: Duration,
    /// Progress texts cycled through an artifact placeholder, per mode.
    pub rotation_messages: HashMap<Mode, Vec<String>>,
    pub text_timeout: Duration,
    pub artifact_timeout: Duration,
    /// Overrides the text/artifact deadline for individual modes.
    pub mode_timeouts: HashMap<Mode, Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rotation_interval: PLACEHOLDER_ROTATION_INTERVAL,
            rotation_messages: HashMap::from([
                (Mode::Media, owned(IMAGE_PROGRESS_MESSAGES)),
                (Mode::Vision, owned(VISION_PROGRESS_MESSAGES)),
            ]),
            text_timeout: TEXT_TIMEOUT,
            artifact_timeout: ARTIFACT_TIMEOUT,
            mode_timeouts: HashMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn timeout_for(&self, mode: Mode) -> Duration {
        if let Some(t) = self.mode_timeouts.get(&mode) {
            return *t;
        }
        if mode.is_artifact() {
            self.artifact_timeout
        } else {
            self.text_timeout
        }
    }

    pub fn messages_for(&self, mode: Mode) -> Vec<String> {
        match self.rotation_messages.get(&mode) {
            Some(messages) if !messages.is_empty() => messages.clone(),
            _ => vec!["Working on it...".to_string()],
        }
    }

    pub fn with_mode_timeout(mut self, mode: Mode, timeout: Duration) -> Self {
        self.mode_timeouts.insert(mode, timeout);
        self
    }
}

/// How a submission ended. Exactly one per request session.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Committed { attempts: u32 },
    Failed { message: String, attempts: u32 },
    Cancelled,
}

fn owned(messages: &[&str]) -> Vec<String> {
    messages.iter().map(|m| m.to_string()).collect()
}

/// Transient state owned by one attempt.
enum AttemptState {
    Draft,
    Placeholder(Uuid),
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    backend: Arc<dyn ChatBackend>,
    store: ConversationStore,
    config: Arc<OrchestratorConfig>,
    sessions: Arc<Mutex<HashMap<Mode, Arc<RequestSession>>>>,
}

/// Single exit point of a session: runs on every return path of `submit`.
struct SessionGuard<'a> {
    orchestrator: &'a ChatOrchestrator,
    session: Arc<RequestSession>,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let mode = self.session.mode;
        let store = &self.orchestrator.store;
        self.session.dispose();
        store.discard_draft(mode);
        store.remove_transients(mode);
        store.set_phase(mode, Phase::Idle);

        let mut sessions = self.orchestrator.sessions();
        if sessions
            .get(&mode)
            .map(|s| s.id == self.session.id)
            .unwrap_or(false)
        {
            sessions.remove(&mode);
        }
    }
}

impl ChatOrchestrator {
    pub fn new(backend: Arc<dyn ChatBackend>, config: OrchestratorConfig) -> Self {
        Self::with_store(backend, config, ConversationStore::new())
    }

    pub fn with_store(
        backend: Arc<dyn ChatBackend>,
        config: OrchestratorConfig,
        store: ConversationStore,
    ) -> Self {
        Self {
            backend,
            store,
            config: Arc::new(config),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Read handle for views.
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Mode, Arc<RequestSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_preconditions(mode: Mode, prompt: &str, attachment: Option<&str>) -> Result<()> {
        match mode.kind() {
            ModeKind::Local => Err(RelayError::InvalidRequest(format!(
                "mode '{}' is handled locally and cannot be submitted",
                mode
            ))
            .into()),
            ModeKind::ImageQuestion => {
                if attachment.map(|a| a.trim().is_empty()).unwrap_or(true) {
                    return Err(
                        RelayError::InvalidRequest("attach an image to ask about it".into()).into(),
                    );
                }
                Ok(())
            }
            ModeKind::Text | ModeKind::ImageGeneration => {
                if prompt.is_empty() {
                    return Err(RelayError::InvalidRequest("prompt cannot be empty".into()).into());
                }
                Ok(())
            }
        }
    }

    /// Submits a prompt for `mode` and drives it to exactly one terminal outcome.
    ///
    /// Returns `Err` only when the submission is refused up front (busy mode, missing
    /// prompt or attachment); everything after that is reported as a `SubmitOutcome`.
    pub async fn submit(
        &self,
        mode: Mode,
        prompt: &str,
        attachment: Option<String>,
    ) -> Result<SubmitOutcome> {
        let prompt = prompt.trim().to_string();
        Self::check_preconditions(mode, &prompt, attachment.as_deref())?;

        let session = Arc::new(RequestSession::new(mode));
        {
            let mut sessions = self.sessions();
            if sessions.contains_key(&mode) || self.store.is_loading(mode) {
                return Err(RelayError::Busy(mode).into());
            }
            sessions.insert(mode, session.clone());
            self.store.set_phase(mode, Phase::Submitting);
        }
        let _guard = SessionGuard {
            orchestrator: self,
            session: session.clone(),
        };

        // Retries replay against this snapshot so the user turn is never duplicated.
        let snapshot: Vec<Message> = self
            .store
            .history(mode)
            .into_iter()
            .filter(|m| !m.is_transient())
            .collect();

        let mut user_message = Message::user(prompt.clone());
        if let Some(image) = &attachment {
            user_message = user_message.with_image(image.clone());
        }
        self.store.push(mode, user_message);

        tracing::info!(
            "[{}] submit session={} prompt={:?}",
            mode,
            crate::str_utils::prefix_chars(&session.id.to_string(), 8),
            crate::str_utils::prefix_chars(&prompt, 40)
        );

        let mut attempt: u32 = 0;
        loop {
            let (state, result) = self
                .run_attempt(&session, mode, &snapshot, &prompt, attachment.as_deref())
                .await;

            let err = match result {
                Ok(final_message) if !session.is_cancelled() => {
                    match (state, final_message) {
                        (AttemptState::Draft, _) => {
                            self.store.commit_draft(mode);
                        }
                        (AttemptState::Placeholder(id), Some(message)) => {
                            self.store.replace(mode, id, message);
                        }
                        (AttemptState::Placeholder(id), None) => {
                            self.store.remove(mode, id);
                        }
                    }
                    tracing::info!("[{}] committed after {} attempt(s)", mode, attempt + 1);
                    return Ok(SubmitOutcome::Committed {
                        attempts: attempt + 1,
                    });
                }
                Ok(_) => RelayError::Cancelled,
                Err(e) => e.inner,
            };

            if matches!(err, RelayError::Cancelled) {
                tracing::info!("[{}] cancelled", mode);
                return Ok(SubmitOutcome::Cancelled);
            }

            if self.config.retry.should_retry(attempt, &err) {
                self.clear_attempt(mode, &state);
                let wait = self.config.retry.backoff(err.estimated_seconds());
                let notice = Message::notice(format!(
                    "The model is warming up. Retrying in {} seconds (attempt {} of {})...",
                    wait.as_secs(),
                    attempt + 1,
                    self.config.retry.max_retries
                ));
                let notice_id = notice.id;
                self.store.push(mode, notice);
                self.store.set_phase(mode, Phase::Retrying);
                tracing::warn!(
                    "[{}] model loading, retry {} in {:?}",
                    mode,
                    attempt + 1,
                    wait
                );

                tokio::select! {
                    biased;
                    _ = session.token().cancelled() => {
                        tracing::info!("[{}] cancelled during backoff", mode);
                        return Ok(SubmitOutcome::Cancelled);
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                self.store.remove(mode, notice_id);
                self.store.set_phase(mode, Phase::Submitting);
                attempt += 1;
                continue;
            }

            let message = match &err {
                RelayError::Timeout(_) => TIMEOUT_APOLOGY.to_string(),
                RelayError::UpstreamLoading { .. } => format!(
                    "The model is still loading after {} attempts. Please try again in a minute.",
                    attempt + 1
                ),
                other => format!("Sorry, something went wrong: {}", other.user_message()),
            };
            tracing::error!("[{}] request failed: {}", mode, err);

            let error_message = Message::model(message.clone());
            match state {
                AttemptState::Draft => {
                    self.store.discard_draft(mode);
                    self.store.push(mode, error_message);
                }
                AttemptState::Placeholder(id) => {
                    if !self.store.replace(mode, id, error_message.clone()) {
                        self.store.push(mode, error_message);
                    }
                }
            }
            return Ok(SubmitOutcome::Failed {
                message,
                attempts: attempt + 1,
            });
        }
    }

    fn clear_attempt(&self, mode: Mode, state: &AttemptState) {
        match state {
            AttemptState::Draft => {
                self.store.discard_draft(mode);
            }
            AttemptState::Placeholder(id) => {
                self.store.remove(mode, *id);
            }
        }
    }

    /// One network attempt under the session's cancellation token and the mode deadline.
    async fn run_attempt(
        &self,
        session: &RequestSession,
        mode: Mode,
        history: &[Message],
        prompt: &str,
        attachment: Option<&str>,
    ) -> (AttemptState, Result<Option<Message>>) {
        let deadline = self.config.timeout_for(mode);

        if !mode.is_artifact() {
            self.store.open_draft(mode);
            let body = self.stream_into_draft(mode, history.to_vec(), prompt.to_string());
            let result = tokio::select! {
                biased;
                _ = session.token().cancelled() => Err(RelayError::Cancelled.into()),
                _ = tokio::time::sleep(deadline) => Err(RelayError::Timeout(deadline).into()),
                res = body => res.map(|_| None),
            };
            return (AttemptState::Draft, result);
        }

        let messages = self.config.messages_for(mode);
        let placeholder = Message::placeholder(messages[0].clone());
        let placeholder_id = placeholder.id;
        self.store.push(mode, placeholder);
        self.store.set_phase(mode, Phase::AwaitingArtifact);

        // Rotation lives only as long as this attempt (and never past the session).
        let attempt_scope = session.timer_scope().child_token();
        let _attempt_guard = attempt_scope.clone().drop_guard();
        self.spawn_rotation(session, mode, placeholder_id, messages, attempt_scope);

        let backend = self.backend.clone();
        let body = async move {
            match mode.kind() {
                ModeKind::ImageQuestion => {
                    let answer = backend
                        .vision(prompt.to_string(), attachment.unwrap_or_default().to_string())
                        .await?;
                    Ok(Some(Message::model(answer)))
                }
                _ => {
                    let image_url = backend.image(prompt.to_string()).await?;
                    Ok(Some(
                        Message::model("")
                            .with_image(image_url)
                            .with_prompt(prompt.to_string()),
                    ))
                }
            }
        };

        let result = tokio::select! {
            biased;
            _ = session.token().cancelled() => Err(RelayError::Cancelled.into()),
            _ = tokio::time::sleep(deadline) => Err(RelayError::Timeout(deadline).into()),
            res = body => res,
        };
        (AttemptState::Placeholder(placeholder_id), result)
    }

    async fn stream_into_draft(&self, mode: Mode, history: Vec<Message>, prompt: String) -> Result<()> {
        let mut stream = self.backend.stream(mode, history, prompt).await?;
        self.store.set_phase(mode, Phase::Streaming);
        while let Some(delta) = stream.next().await {
            self.store.append_draft(mode, &delta?);
        }
        Ok(())
    }

    fn spawn_rotation(
        &self,
        session: &RequestSession,
        mode: Mode,
        placeholder_id: Uuid,
        messages: Vec<String>,
        scope: CancellationToken,
    ) {
        let store = self.store.clone();
        let interval = self.config.rotation_interval;
        session.spawn_timer(async move {
            let mut index = 0usize;
            loop {
                tokio::select! {
                    _ = scope.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if scope.is_cancelled() {
                    return;
                }
                index = (index + 1) % messages.len();
                if !store.update_placeholder(mode, placeholder_id, &messages[index]) {
                    return;
                }
            }
        });
    }

    /// Cancels the in-flight request for `mode`. Returns whether anything was cancelled.
    pub fn cancel(&self, mode: Mode) -> bool {
        let session = self.sessions().get(&mode).cloned();
        match session {
            Some(session) => {
                tracing::info!("[{}] cancel requested", mode);
                session.cancel();
                true
            }
            None if self.store.is_loading(mode) => {
                tracing::warn!("[{}] cancel with no active session, forcing idle", mode);
                self.store.discard_draft(mode);
                self.store.remove_transients(mode);
                self.store.set_phase(mode, Phase::Idle);
                true
            }
            None => false,
        }
    }

    /// Clears a mode's conversation. Refused while a request is in flight.
    pub fn clear(&self, mode: Mode) -> Result<()> {
        if self.store.is_loading(mode) {
            return Err(RelayError::Busy(mode).into());
        }
        self.store.clear(mode);
        Ok(())
    }

    pub async fn model_status(&self) -> Result<BTreeMap<String, ModelReadiness>> {
        self.backend.status().await
    }

    /// Polls `wakeup` until the primary model is ready, offline, or polls run out.
    pub async fn await_ready(
        &self,
        max_polls: u32,
        cancel: &CancellationToken,
    ) -> Result<WakeupStatus> {
        let mut last = WakeupStatus {
            status: WakeupState::Loading,
            estimated_time: None,
            detail: None,
        };
        for poll in 0..max_polls {
            last = self.backend.wakeup().await?;
            if last.status != WakeupState::Loading {
                return Ok(last);
            }
            let wait = estimated_wait(last.estimated_time).max(WAKEUP_POLL_FLOOR);
            tracing::info!(
                "Primary model loading (poll {}/{}), checking again in {:?}",
                poll + 1,
                max_polls,
                wait
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled.into()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
        Ok(last)
    }
}
