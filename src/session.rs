use crate::config::SessionConfig;
use crate::errors::ApiError;
use crate::models::UserProfile;
use crate::upstream::{Auth, GitLabApi};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Server-side session record. The token never leaves this module except
/// through `with_token`, scoped to a single upstream call chain.
pub struct Session {
    pub id: String,
    pub base_url: String,
    token: String,
    pub user: UserProfile,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    window_started: DateTime<Utc>,
    window_count: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("user", &self.user.username)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

/// Public view handed to handlers; no token.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub base_url: String,
    pub user: UserProfile,
}

/// Process-wide session store behind a reader-writer lock. Sessions idle
/// past the TTL are reaped by a periodic sweeper started from main.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    api: Arc<dyn GitLabApi>,
    idle_ttl: ChronoDuration,
    request_limit: u32,
    request_window: ChronoDuration,
}

impl SessionStore {
    pub fn new(config: &SessionConfig, api: Arc<dyn GitLabApi>) -> Self {
        SessionStore {
            sessions: RwLock::new(HashMap::new()),
            api,
            idle_ttl: ChronoDuration::seconds(config.idle_ttl_secs as i64),
            request_limit: config.request_limit,
            request_window: ChronoDuration::seconds(config.request_window_secs as i64),
        }
    }

    /// Validate the token against the upstream `/user` endpoint and mint a
    /// session. The token is held server-side from here on.
    pub async fn create(
        &self,
        base_url: String,
        token: String,
    ) -> Result<(String, UserProfile), ApiError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() || token.is_empty() {
            return Err(ApiError::Validation(
                "base_url and token are required".into(),
            ));
        }

        let auth = Auth {
            base_url: base_url.clone(),
            token: token.clone(),
        };
        let user = self.api.current_user(&auth).await?;

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().simple().to_string(),
            base_url,
            token,
            user: user.clone(),
            created_at: now,
            last_seen: now,
            window_started: now,
            window_count: 0,
        };
        let id = session.id.clone();

        let mut sessions = self.sessions.write().await;
        sessions.insert(id.clone(), session);
        log::info!(
            "session_created session_id={} user={} total={}",
            id,
            user.username,
            sessions.len()
        );
        Ok((id, user))
    }

    fn live(&self, session: &Session, now: DateTime<Utc>) -> bool {
        now - session.last_seen <= self.idle_ttl
    }

    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(id)?;
        if !self.live(session, Utc::now()) {
            return None;
        }
        Some(SessionInfo {
            id: session.id.clone(),
            base_url: session.base_url.clone(),
            user: session.user.clone(),
        })
    }

    /// Refresh last-seen and enforce the coarse per-session request window.
    /// Called by the gateway for every authenticated request; engine-side
    /// token borrows do not count against the window.
    pub async fn touch(&self, id: &str) -> Result<SessionInfo, ApiError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .filter(|s| now - s.last_seen <= self.idle_ttl)
            .ok_or_else(|| ApiError::BadCredentials("session expired or unknown".into()))?;

        session.last_seen = now;
        if now - session.window_started > self.request_window {
            session.window_started = now;
            session.window_count = 0;
        }
        session.window_count += 1;
        if session.window_count > self.request_limit {
            return Err(ApiError::RateLimited {
                retry_after_secs: Some(
                    (self.request_window - (now - session.window_started))
                        .num_seconds()
                        .max(1) as u64,
                ),
            });
        }

        Ok(SessionInfo {
            id: session.id.clone(),
            base_url: session.base_url.clone(),
            user: session.user.clone(),
        })
    }

    /// Run `f` with the session's credentials without handing the token out.
    /// The store lock is released before the upstream call runs, so a revoke
    /// takes effect at the caller's next borrow.
    pub async fn with_token<T, F, Fut>(&self, id: &str, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(Auth) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let auth = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(id)
                .filter(|s| self.live(s, Utc::now()))
                .ok_or_else(|| ApiError::BadCredentials("session expired or revoked".into()))?;
            Auth {
                base_url: session.base_url.clone(),
                token: session.token.clone(),
            }
        };
        f(auth).await
    }

    pub async fn revoke(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(id).is_some();
        if removed {
            log::info!("session_revoked session_id={}", id);
        }
        removed
    }

    /// Drop sessions idle past the TTL. Returns how many were reaped.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| now - s.last_seen <= self.idle_ttl);
        let reaped = before - sessions.len();
        if reaped > 0 {
            log::info!("session_sweep reaped={} remaining={}", reaped, sessions.len());
        }
        reaped
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
