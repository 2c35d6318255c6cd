//! # Session Manager
//!
//! Creates sessions, keeps their handles, sweeps the finished ones and shuts all of
//! them down when the service stops.
//!
//! Each session runs as its own spawned task group. A panic inside one of them ends
//! up as a `JoinError` here and never reaches another session or the HTTP workers.

use super::process::{short_id, SessionContext, SessionProcess};
use crate::broker::Liveness;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{SessionAnswer, SessionOffer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

struct SessionHandle {
    finalize: Liveness,
    task: JoinHandle<()>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    join_timeout: Duration,
}

impl SessionManager {
    pub fn new(join_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            join_timeout,
        }
    }

    /// Start a session for `offer` and wait for its SDP answer.
    ///
    /// Admission is decided under the same lock that registers the session, so
    /// concurrent offers cannot push the count past `max_sessions + 1`. The session
    /// keeps running on its own after the answer is returned.
    pub async fn create_session(
        &self,
        offer: SessionOffer,
        context: SessionContext,
        max_sessions: usize,
    ) -> PipelineResult<SessionAnswer> {
        let session_id = Uuid::now_v7().to_string();
        let answer_timeout = context.answer_deadline();
        let finalize = Liveness::new();
        let (answer_tx, answer_rx) = oneshot::channel();

        {
            let mut sessions = self.sessions.lock();
            if sessions.len() > max_sessions {
                warn!(running = sessions.len(), max_sessions, "Session limit reached");
                return Err(PipelineError::SessionLimit(sessions.len()));
            }

            let span = info_span!("session", id = %short_id(&session_id));
            let process = SessionProcess::new(&session_id, context, finalize.clone());
            let task = tokio::spawn(process.run(offer, answer_tx).instrument(span));
            sessions.insert(
                session_id.clone(),
                SessionHandle {
                    finalize: finalize.clone(),
                    task,
                },
            );
        }
        info!(session_id, "Session created");

        match tokio::time::timeout(answer_timeout, answer_rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => {
                finalize.clear("session task ended before answering");
                Err(PipelineError::Negotiation("Session ended before answering".into()))
            }
            Err(_) => {
                finalize.clear("answer timed out");
                Err(PipelineError::Timeout("No SDP answer in time".into()))
            }
        }
    }

    /// Register a session that does nothing until it is finalized.
    #[cfg(test)]
    pub(crate) fn insert_idle_session(&self, session_id: &str) {
        let finalize = Liveness::new();
        let watched = finalize.clone();
        let task = tokio::spawn(async move {
            while watched.is_live() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        self.sessions.lock().insert(session_id.to_string(), SessionHandle { finalize, task });
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove sessions that finalized or whose task already ended, joining each one
    /// within the join timeout. Returns the ids still running.
    pub async fn cleanup_sessions(&self) -> Vec<String> {
        let finished: Vec<(String, SessionHandle)> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, handle)| !handle.finalize.is_live() || handle.task.is_finished())
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|handle| (id, handle)))
                .collect()
        };

        for (session_id, handle) in finished {
            self.join(&session_id, handle).await;
        }
        self.session_ids()
    }

    /// Finalize every session, then join them all, aborting the ones that do not stop.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, SessionHandle)> = self.sessions.lock().drain().collect();
        info!(sessions = sessions.len(), "Shutting down RTC sessions");

        for (_, handle) in &sessions {
            handle.finalize.clear("service shutdown");
        }
        for (session_id, handle) in sessions {
            self.join(&session_id, handle).await;
        }
    }

    async fn join(&self, session_id: &str, handle: SessionHandle) {
        let SessionHandle { mut task, .. } = handle;
        match tokio::time::timeout(self.join_timeout, &mut task).await {
            Ok(Ok(())) => info!(session_id, "Session closed"),
            Ok(Err(e)) if e.is_panic() => error!(session_id, "Session task panicked"),
            Ok(Err(e)) => warn!(session_id, error = %e, "Session task cancelled"),
            Err(_) => {
                warn!(session_id, "Session did not stop in time, aborting");
                task.abort();
            }
        }
    }
}
