//! Browser session lifecycle: the single active-session registry.
//!
//! Every run owns exactly one session, opened here and released here. Close is
//! best-effort and idempotent: provider errors are logged, never rethrown, and
//! the registry entry is always removed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::automation::{AutomationProvider, SessionHandle};
use crate::error::{Error, Result};

/// Cosmetic style applied to every freshly opened session: calms animations
/// and hides scrollbars so screenshots stay comparable across runs.
const SESSION_STYLE: &str = "\
*, *::before, *::after { animation-duration: 0s !important; transition-duration: 0s !important; } \
::-webkit-scrollbar { display: none; }";

#[derive(Debug, Clone)]
pub struct ManagedSession {
    pub id: String,
    pub handle: SessionHandle,
    pub target_url: String,
    pub opened_at: DateTime<Utc>,
}

pub struct SessionManager {
    provider: Arc<dyn AutomationProvider>,
    embed_base: String,
    active: RwLock<HashMap<String, ManagedSession>>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn AutomationProvider>, embed_base: impl Into<String>) -> Self {
        Self {
            provider,
            embed_base: embed_base.into(),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session: navigate, apply the cosmetic style injection, tag with
    /// a generated id and track it in the registry.
    pub async fn open(&self, url: &str) -> Result<ManagedSession> {
        let handle = self.provider.open_session(url).await?;

        // Style injection is cosmetic; a failure should not lose the session.
        if let Err(e) = self.provider.inject_style(&handle, SESSION_STYLE).await {
            warn!(external_id = %handle.external_id, error = %e, "style injection failed");
        }

        let session = ManagedSession {
            id: Uuid::new_v4().to_string(),
            handle,
            target_url: url.to_string(),
            opened_at: Utc::now(),
        };

        info!(
            session_id = %session.id,
            external_id = %session.handle.external_id,
            url = %url,
            "session opened"
        );

        self.active
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Close a session. Best-effort: the provider error is logged, the entry
    /// is always removed. Closing an unknown or already-closed id is a no-op,
    /// which makes double release in orchestrator error paths harmless.
    pub async fn close(&self, id: &str) {
        let removed = self.active.write().await.remove(id);
        match removed {
            Some(session) => {
                if let Err(e) = self.provider.close_session(&session.handle).await {
                    warn!(session_id = %id, error = %e, "provider close failed");
                } else {
                    info!(session_id = %id, "session closed");
                }
            }
            None => {
                info!(session_id = %id, "close requested for untracked session");
            }
        }
    }

    /// Debug/live-view link for a session. Falls back to the deterministic
    /// embed URL pattern when the provider cannot produce one.
    pub async fn live_view_url(&self, id: &str) -> Result<String> {
        let external_id = {
            let active = self.active.read().await;
            let session = active
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("session {}", id)))?;
            session.handle.external_id.clone()
        };

        match self.provider.get_debug_url(&external_id).await {
            Ok(url) => Ok(url),
            Err(e) => {
                warn!(session_id = %id, error = %e, "debug url lookup failed, using embed fallback");
                Ok(format!("{}/embed/{}", self.embed_base, external_id))
            }
        }
    }

    /// Close every tracked session, collecting outcomes without letting one
    /// failure abort the rest.
    pub async fn cleanup_all(&self) -> usize {
        let ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        let count = ids.len();
        for id in ids {
            self.close(&id).await;
        }
        count
    }

    /// Reap sessions older than `max_age_secs`. Returns the ids closed.
    pub async fn close_expired(&self, max_age_secs: u64) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let active = self.active.read().await;
            active
                .values()
                .filter(|s| (now - s.opened_at).num_seconds() >= max_age_secs as i64)
                .map(|s| s.id.clone())
                .collect()
        };
        for id in &expired {
            warn!(session_id = %id, "session expired, closing");
            self.close(id).await;
        }
        expired
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn get(&self, id: &str) -> Option<ManagedSession> {
        self.active.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{AgentConfig, AgentRun, ProposedAction};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider double that counts opens/closes and can fail on demand.
    struct CountingProvider {
        opens: AtomicUsize,
        closes: AtomicUsize,
        fail_close: bool,
        fail_debug_url: bool,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_close: false,
                fail_debug_url: false,
            }
        }

        fn failing_close() -> Self {
            Self {
                fail_close: true,
                ..Self::new()
            }
        }

        fn failing_debug_url() -> Self {
            Self {
                fail_debug_url: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl AutomationProvider for CountingProvider {
        async fn open_session(&self, _url: &str) -> Result<SessionHandle> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(SessionHandle {
                external_id: format!("ext-{}", n),
            })
        }

        async fn close_session(&self, _handle: &SessionHandle) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(Error::provider("close exploded"));
            }
            Ok(())
        }

        async fn inject_style(&self, _handle: &SessionHandle, _css: &str) -> Result<()> {
            Ok(())
        }

        async fn propose_actions(
            &self,
            _handle: &SessionHandle,
            _instruction: &str,
        ) -> Result<Vec<ProposedAction>> {
            Ok(vec![])
        }

        async fn execute_candidate(
            &self,
            _handle: &SessionHandle,
            _action: &ProposedAction,
        ) -> Result<Vec<crate::model::TimelineEvent>> {
            Ok(vec![])
        }

        async fn execute_action(
            &self,
            _handle: &SessionHandle,
            _instruction: &str,
        ) -> Result<Vec<crate::model::TimelineEvent>> {
            Ok(vec![])
        }

        async fn run_agent(
            &self,
            _handle: &SessionHandle,
            _config: AgentConfig,
        ) -> Result<AgentRun> {
            Err(Error::provider("not supported in this double"))
        }

        async fn get_debug_url(&self, external_id: &str) -> Result<String> {
            if self.fail_debug_url {
                return Err(Error::provider("no debug url"));
            }
            Ok(format!("https://debug.example.com/{}", external_id))
        }

        async fn screenshot(&self, _handle: &SessionHandle) -> Result<Vec<u8>> {
            Ok(vec![])
        }

        async fn extract_context(&self, _handle: &SessionHandle) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn manager(provider: CountingProvider) -> (Arc<CountingProvider>, SessionManager) {
        let provider = Arc::new(provider);
        let manager = SessionManager::new(provider.clone(), "https://live.example.com");
        (provider, manager)
    }

    #[tokio::test]
    async fn test_open_tracks_session() {
        let (provider, manager) = manager(CountingProvider::new());
        let session = manager.open("https://target.example.com").await.unwrap();
        assert_eq!(manager.active_count().await, 1);
        assert_eq!(provider.opens.load(Ordering::SeqCst), 1);
        assert!(manager.get(&session.id).await.is_some());
    }

    #[tokio::test]
    async fn test_close_removes_and_is_idempotent() {
        let (provider, manager) = manager(CountingProvider::new());
        let session = manager.open("https://target.example.com").await.unwrap();

        manager.close(&session.id).await;
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(provider.closes.load(Ordering::SeqCst), 1);

        // Double release: no provider call, no panic.
        manager.close(&session.id).await;
        assert_eq!(provider.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_swallows_provider_error() {
        let (provider, manager) = manager(CountingProvider::failing_close());
        let session = manager.open("https://target.example.com").await.unwrap();
        manager.close(&session.id).await;
        // Entry removed even though provider close failed
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(provider.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_live_view_url_provider() {
        let (_, manager) = manager(CountingProvider::new());
        let session = manager.open("https://target.example.com").await.unwrap();
        let url = manager.live_view_url(&session.id).await.unwrap();
        assert!(url.starts_with("https://debug.example.com/"));
    }

    #[tokio::test]
    async fn test_live_view_url_fallback() {
        let (_, manager) = manager(CountingProvider::failing_debug_url());
        let session = manager.open("https://target.example.com").await.unwrap();
        let url = manager.live_view_url(&session.id).await.unwrap();
        assert_eq!(
            url,
            format!(
                "https://live.example.com/embed/{}",
                session.handle.external_id
            )
        );
    }

    #[tokio::test]
    async fn test_live_view_url_unknown_session() {
        let (_, manager) = manager(CountingProvider::new());
        assert!(manager.live_view_url("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_all_survives_failures() {
        let (provider, manager) = manager(CountingProvider::failing_close());
        manager.open("https://a.example.com").await.unwrap();
        manager.open("https://b.example.com").await.unwrap();
        manager.open("https://c.example.com").await.unwrap();

        let closed = manager.cleanup_all().await;
        assert_eq!(closed, 3);
        assert_eq!(manager.active_count().await, 0);
        // Every close was attempted even though all failed
        assert_eq!(provider.closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_expired() {
        let (_, manager) = manager(CountingProvider::new());
        let session = manager.open("https://target.example.com").await.unwrap();

        // Nothing is old enough yet
        let expired = manager.close_expired(3600).await;
        assert!(expired.is_empty());
        assert_eq!(manager.active_count().await, 1);

        // Everything at age >= 0 is expired
        let expired = manager.close_expired(0).await;
        assert_eq!(expired, vec![session.id]);
        assert_eq!(manager.active_count().await, 0);
    }
}
