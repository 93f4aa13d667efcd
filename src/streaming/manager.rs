//! Process-wide transcode session registry.
//!
//! The registry's one hard invariant: at most one live transcoder process
//! across the whole process, ever. A LAN box serves one phone or browser at a
//! time, and the (typically single) hardware encoder is not worth contending
//! over, so starting a session for a new file evicts everything else. All
//! mutation goes through one coarse lock so the invariant can't be observed
//! violated even transiently by a concurrent insert.

use crate::streaming::encoder::EncoderSelector;
use crate::streaming::quality::QualityTier;
use crate::streaming::session::{EngineTools, SessionKey, TranscodeSession, WaitPolicy};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<TranscodeSession>>>,
    tools: EngineTools,
    encoder: Arc<EncoderSelector>,
    policy: WaitPolicy,
    /// Sessions untouched for this long are disposed by the reaper.
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        tools: EngineTools,
        encoder: Arc<EncoderSelector>,
        policy: WaitPolicy,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            tools,
            encoder,
            policy,
            idle_timeout,
        }
    }

    /// Return the session for this file+tier, creating it if needed.
    ///
    /// An existing error-free session is reused as-is. Anything else —
    /// different key, or a session stuck on an error — means every existing
    /// session is disposed before the new one starts.
    pub async fn get_or_start(
        &self,
        relative_path: &str,
        source: PathBuf,
        tier: QualityTier,
    ) -> anyhow::Result<Arc<TranscodeSession>> {
        let key = SessionKey::new(relative_path, tier);
        let id = key.id();

        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&id) {
            if existing.error().is_none() {
                tracing::debug!(session = %id, "reusing existing session");
                return Ok(Arc::clone(existing));
            }
        }

        for (evicted_id, session) in sessions.drain() {
            tracing::info!(session = %evicted_id, "evicting session for new stream");
            session.dispose().await;
        }

        let session = TranscodeSession::create(
            key,
            source,
            self.tools.clone(),
            Arc::clone(&self.encoder),
            self.policy,
        )
        .await?;
        sessions.insert(id, Arc::clone(&session));
        Ok(session)
    }

    /// Look up a session by its identifier.
    pub async fn get(&self, id: &str) -> Option<Arc<TranscodeSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Dispose a session immediately. Returns whether it existed.
    pub async fn stop(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            Some(session) => {
                session.dispose().await;
                true
            }
            None => false,
        }
    }

    /// Dispose sessions nobody has touched within the idle threshold.
    pub async fn reap_idle(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.idle_for() >= self.idle_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some(session) = sessions.remove(&id) {
                tracing::info!(
                    session = %id,
                    idle_secs = session.idle_for().as_secs(),
                    "reaping idle session"
                );
                session.dispose().await;
                removed += 1;
            }
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Start the background task that periodically reaps idle sessions.
pub fn start_reaper(manager: Arc<SessionManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            manager.reap_idle().await;
        }
    })
}
