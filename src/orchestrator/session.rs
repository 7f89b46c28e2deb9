use crate::types::Mode;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One outstanding prompt submission and everything scheduled on its behalf.
///
/// `cancel` is the user-facing token observed at every suspension point. Timers run
/// under a child token that `dispose` trips, so they stop on every exit path, not
/// only on cancellation.
pub struct RequestSession {
    pub id: Uuid,
    pub mode: Mode,
    cancel: CancellationToken,
    timer_scope: CancellationToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl RequestSession {
    pub fn new(mode: Mode) -> Self {
        let cancel = CancellationToken::new();
        let timer_scope = cancel.child_token();
        Self {
            id: Uuid::new_v4(),
            mode,
            cancel,
            timer_scope,
            timers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Runs `task` until it finishes or the session ends, whichever is first.
    pub fn spawn_timer<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_disposed() {
            return;
        }
        let scope = self.timer_scope.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = task => {}
            }
        });
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.push(handle);
    }

    /// Stops every timer belonging to this session. Only the first call has an effect.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.timer_scope.cancel();
        let handles = {
            let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *timers)
        };
        for handle in &handles {
            handle.abort();
        }
        tracing::debug!(
            "[{}] session {} disposed ({} timers)",
            self.mode,
            crate::str_utils::prefix_chars(&self.id.to_string(), 8),
            handles.len()
        );
        true
    }

    /// Tripped when the session ends, for timers that check liveness before a side effect.
    pub fn timer_scope(&self) -> CancellationToken {
        self.timer_scope.clone()
    }
}

impl Drop for RequestSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
