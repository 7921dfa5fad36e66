use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Duration, Utc};
use cookie::time::Duration as CookieDuration;
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthBackend, AuthError},
    types::{Session, User},
};

pub const ACCESS_TOKEN_COOKIE: &str = "kb-access-token";
pub const REFRESH_TOKEN_COOKIE: &str = "kb-refresh-token";
pub const EXPIRES_AT_COOKIE: &str = "kb-expires-at";
pub const CODE_VERIFIER_COOKIE: &str = "kb-code-verifier";

const SESSION_COOKIE_MAX_AGE_DAYS: i64 = 400;

/// Where the session is being read. Pages render after the gate has already
/// refreshed the session, so their writes are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionContext {
    Page,
    Api,
    Middleware,
}

impl SessionContext {
    fn can_write(self) -> bool {
        !matches!(self, SessionContext::Page)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub refresh_margin: Duration,
    pub secure_cookies: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::seconds(60),
            secure_cookies: false,
        }
    }
}

pub struct SessionStore {
    jar: CookieJar,
    context: SessionContext,
    policy: SessionPolicy,
}

impl SessionStore {
    pub fn new(jar: CookieJar, context: SessionContext, policy: SessionPolicy) -> Self {
        Self {
            jar,
            context,
            policy,
        }
    }

    pub fn access_token(&self) -> Option<String> {
        cookie_value(&self.jar, ACCESS_TOKEN_COOKIE)
    }

    pub fn refresh_token(&self) -> Option<String> {
        cookie_value(&self.jar, REFRESH_TOKEN_COOKIE)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        cookie_value(&self.jar, EXPIRES_AT_COOKIE)
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
    }

    pub fn code_verifier(&self) -> Option<String> {
        cookie_value(&self.jar, CODE_VERIFIER_COOKIE)
    }

    /// Any failure means "no session".
    pub async fn resolve_user(&mut self, auth: &dyn AuthBackend) -> Option<User> {
        match self.authenticate(auth).await {
            Ok(user) => user,
            Err(error) => {
                warn!(?error, "session validation failed");
                None
            }
        }
    }

    /// An unreachable auth service is an error here, and cookies are kept.
    pub async fn authenticate(
        &mut self,
        auth: &dyn AuthBackend,
    ) -> Result<Option<User>, AuthError> {
        let Some(access_token) = self.access_token() else {
            return Ok(None);
        };
        // Rotating without being able to persist the result would burn the refresh token.
        let can_refresh = self.context.can_write();

        if !(can_refresh && self.refresh_due(Utc::now())) {
            match auth.get_user(&access_token).await {
                Ok(user) => return Ok(Some(user)),
                Err(AuthError::Expired) if can_refresh => {
                    debug!("access token expired; attempting refresh");
                }
                Err(AuthError::Expired) => {
                    debug!("access token expired in read-only context");
                    return Ok(None);
                }
                Err(AuthError::Rejected(message)) => {
                    debug!(%message, "session rejected by auth service");
                    return Ok(None);
                }
                Err(error) => return Err(error),
            }
        }

        self.refresh(auth).await
    }

    async fn refresh(&mut self, auth: &dyn AuthBackend) -> Result<Option<User>, AuthError> {
        let Some(refresh_token) = self.refresh_token() else {
            self.clear();
            return Ok(None);
        };

        let session = match auth.refresh_session(&refresh_token).await {
            Ok(session) => session,
            Err(AuthError::Service(source)) => return Err(AuthError::Service(source)),
            Err(error) => {
                debug!(?error, "session refresh failed; clearing cookies");
                self.clear();
                return Ok(None);
            }
        };

        self.store(&session);
        match auth.get_user(&session.access_token).await {
            Ok(user) => {
                info!(user_id = %user.id, "session refreshed");
                Ok(Some(user))
            }
            Err(AuthError::Service(source)) => Err(AuthError::Service(source)),
            Err(error) => {
                warn!(?error, "refreshed session could not be validated");
                Ok(None)
            }
        }
    }

    fn refresh_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at()
            .is_some_and(|expires_at| expires_at - self.policy.refresh_margin <= now)
    }

    pub fn store(&mut self, session: &Session) {
        self.set(ACCESS_TOKEN_COOKIE, session.access_token.clone());
        self.set(REFRESH_TOKEN_COOKIE, session.refresh_token.clone());
        self.set(EXPIRES_AT_COOKIE, session.expires_at.timestamp().to_string());
    }

    pub fn store_code_verifier(&mut self, verifier: &str) {
        self.set(CODE_VERIFIER_COOKIE, verifier.to_owned());
    }

    pub fn clear_code_verifier(&mut self) {
        self.remove(CODE_VERIFIER_COOKIE);
    }

    pub fn clear(&mut self) {
        self.remove(ACCESS_TOKEN_COOKIE);
        self.remove(REFRESH_TOKEN_COOKIE);
        self.remove(EXPIRES_AT_COOKIE);
    }

    pub fn into_jar(self) -> CookieJar {
        self.jar
    }

    fn set(&mut self, name: &'static str, value: String) {
        if !self.context.can_write() {
            debug!(cookie = name, "ignoring cookie write from page context");
            return;
        }
        let cookie = Cookie::build((name, value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.policy.secure_cookies)
            .max_age(CookieDuration::days(SESSION_COOKIE_MAX_AGE_DAYS))
            .build();
        self.jar = self.jar.clone().add(cookie);
    }

    fn remove(&mut self, name: &'static str) {
        if !self.context.can_write() {
            debug!(cookie = name, "ignoring cookie removal from page context");
            return;
        }
        self.jar = self
            .jar
            .clone()
            .remove(Cookie::build((name, "")).path("/").build());
    }
}

fn cookie_value(jar: &CookieJar, name: &str) -> Option<String> {
    jar.get(name)
        .map(|cookie| cookie.value().to_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum_extra::extract::cookie::{Cookie, CookieJar};
    use chrono::{Duration, Utc};

    use crate::{auth::MockAuthBackend, types::Session};

    use super::{
        ACCESS_TOKEN_COOKIE, EXPIRES_AT_COOKIE, REFRESH_TOKEN_COOKIE, SessionContext,
        SessionPolicy, SessionStore,
    };

    fn jar_for(session: &Session) -> CookieJar {
        CookieJar::new()
            .add(Cookie::new(ACCESS_TOKEN_COOKIE, session.access_token.clone()))
            .add(Cookie::new(REFRESH_TOKEN_COOKIE, session.refresh_token.clone()))
            .add(Cookie::new(
                EXPIRES_AT_COOKIE,
                session.expires_at.timestamp().to_string(),
            ))
    }

    #[tokio::test]
    async fn no_cookie_means_no_user() {
        let auth = MockAuthBackend::default();
        let mut store = SessionStore::new(
            CookieJar::new(),
            SessionContext::Api,
            SessionPolicy::default(),
        );
        assert!(store.resolve_user(&auth).await.is_none());
    }

    #[tokio::test]
    async fn valid_session_resolves_without_rotation() {
        let auth = MockAuthBackend::default();
        let seeded = auth.seed_user("fan@example.com", "hunter22").await;
        let session = auth.issue_session("fan@example.com").await.expect("session");

        let mut store = SessionStore::new(
            jar_for(&session),
            SessionContext::Middleware,
            SessionPolicy::default(),
        );
        let user = store.resolve_user(&auth).await.expect("user");
        assert_eq!(user.id, seeded.id);
        assert_eq!(store.access_token(), Some(session.access_token));
    }

    #[tokio::test]
    async fn near_expiry_session_is_rotated() {
        let auth = MockAuthBackend::new(Duration::seconds(30));
        auth.seed_user("fan@example.com", "hunter22").await;
        let session = auth.issue_session("fan@example.com").await.expect("session");

        let mut store = SessionStore::new(
            jar_for(&session),
            SessionContext::Middleware,
            SessionPolicy::default(),
        );
        assert!(store.resolve_user(&auth).await.is_some());
        let rotated = store.access_token().expect("rotated token");
        assert_ne!(rotated, session.access_token);
    }

    #[tokio::test]
    async fn failed_refresh_clears_cookies() {
        let auth = MockAuthBackend::default();
        auth.seed_user("fan@example.com", "hunter22").await;
        let session = auth.issue_session("fan@example.com").await.expect("session");
        auth.expire_access_token(&session.access_token).await;
        auth.revoke_refresh_token(&session.refresh_token).await;

        let mut store = SessionStore::new(
            jar_for(&session),
            SessionContext::Api,
            SessionPolicy::default(),
        );
        assert!(store.resolve_user(&auth).await.is_none());
        assert!(store.access_token().is_none());
        assert!(store.refresh_token().is_none());
    }

    #[tokio::test]
    async fn page_context_never_writes() {
        let auth = MockAuthBackend::new(Duration::seconds(10));
        auth.seed_user("fan@example.com", "hunter22").await;
        let session = auth.issue_session("fan@example.com").await.expect("session");

        let mut store = SessionStore::new(
            jar_for(&session),
            SessionContext::Page,
            SessionPolicy::default(),
        );
        assert!(store.resolve_user(&auth).await.is_some());
        assert_eq!(store.access_token(), Some(session.access_token.clone()));

        store.clear();
        assert_eq!(store.access_token(), Some(session.access_token));
    }

    #[test]
    fn refresh_is_due_inside_margin() {
        let jar = CookieJar::new().add(Cookie::new(
            EXPIRES_AT_COOKIE,
            (Utc::now() + Duration::seconds(30)).timestamp().to_string(),
        ));
        let store = SessionStore::new(jar, SessionContext::Api, SessionPolicy::default());
        assert!(store.refresh_due(Utc::now()));
        assert!(!store.refresh_due(Utc::now() - Duration::minutes(5)));
    }
}
