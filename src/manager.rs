//! Process-wide registry of sessions keyed by caller-provided ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures_util::future::join_all;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::CellError;
use crate::session::{Session, SessionSnapshot};

pub struct SessionManager {
    settings: Arc<Settings>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The session for `id`, created and started on first use.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>, CellError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(id) {
            return Ok(session.clone());
        }
        let session = Arc::new(Session::new(id, self.settings.clone()));
        session.ensure_started().await?;
        sessions.insert(id.to_string(), session.clone());
        info!(session = %id, "session created");
        Ok(session)
    }

    pub async fn reset(&self, id: &str) -> Result<(), CellError> {
        self.get(id).await?.reset().await
    }

    pub async fn cancel(&self, id: &str) -> Result<(), CellError> {
        self.get(id).await?.cancel().await
    }

    /// Remove and shut down one session. Returns whether it existed.
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            Some(session) => {
                if let Err(err) = session.shutdown().await {
                    warn!(session = %id, "shutdown failed: {err}");
                }
                info!(session = %id, "session closed");
                true
            }
            None => false,
        }
    }

    pub async fn cull_idle(&self) -> usize {
        self.cull_idle_at(SystemTime::now()).await
    }

    /// Shut down every session idle longer than the TTL as of `now`.
    pub async fn cull_idle_at(&self, now: SystemTime) -> usize {
        let stale: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.should_cull(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        if stale.is_empty() {
            return 0;
        }
        let count = stale.len();
        shutdown_all(stale).await;
        info!(count, "culled idle sessions");
        count
    }

    /// Shut down every session. The manager stays usable afterwards.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        let count = drained.len();
        shutdown_all(drained).await;
        info!(count, "all sessions shut down");
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        let mut snapshots: Vec<SessionSnapshot> = sessions.iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cull idle sessions every `every` until the returned handle is stopped.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> IdleReaper {
        let manager = Arc::clone(self);
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let culled = manager.cull_idle().await;
                        debug!(culled, "idle sweep finished");
                    }
                }
            }
        });
        IdleReaper { stop, handle }
    }
}

async fn shutdown_all(sessions: Vec<Arc<Session>>) {
    let results = join_all(sessions.iter().map(|session| session.shutdown())).await;
    for (session, result) in sessions.iter().zip(results) {
        if let Err(err) = result {
            warn!(session = %session.id(), "shutdown failed: {err}");
        }
    }
}

/// Handle to the background idle sweep.
pub struct IdleReaper {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl IdleReaper {
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.handle.await {
            warn!("idle reaper task failed: {err}");
        }
    }
}
