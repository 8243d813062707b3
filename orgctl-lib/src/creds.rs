//! Caching, renewing credentials provider
//!
//! A [`Provider`] owns one set of credentials and the function that renews
//! them. Readers see an immutable [`Snapshot`] swapped in whole on every
//! renewal attempt; renewal itself is serialized by a single async lock so
//! that a stampede of callers produces exactly one upstream request.
//!
//! Failures are cached too. A failed renewal becomes a negative snapshot with
//! a synthetic expiry (2 minutes when throttled, 2 hours otherwise) and every
//! caller gets that error back until it expires. This bounds the pressure on
//! a failing upstream without ever retrying in a loop.

use crate::clock::{self, SharedClock};
use crate::{OrgError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// How long a throttled renewal is cached before the next attempt.
pub const THROTTLE_BACKOFF: Duration = Duration::from_secs(2 * 60);

/// How long any other failed renewal is cached before the next attempt.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(2 * 60 * 60);

/// Validity requested by [`Provider::retrieve`].
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(60);

/// Default safety margin subtracted from temporary credential expiry.
pub const DEFAULT_MARGIN: Duration = Duration::from_secs(60);

/// Access credentials, permanent or temporary.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creds {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_token: String,
    pub can_expire: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    /// Where these credentials came from (e.g. "env", a role ARN)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

impl Creds {
    /// Long-lived credentials that never expire.
    pub fn permanent(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            ..Self::default()
        }
    }

    /// Session credentials with an expiry.
    pub fn temporary(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: session_token.into(),
            can_expire: true,
            expires: Some(expires),
            source: String::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Reads the base identity from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
    /// and optional `AWS_SESSION_TOKEN`.
    ///
    /// Without a session token the credentials are treated as permanent. With
    /// one, the expiry is unknown, so they are also treated as non-expiring;
    /// the remote service will reject them once they lapse.
    pub fn from_env() -> Result<Self> {
        let id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| OrgError::config("AWS_ACCESS_KEY_ID not set"))?;
        let secret = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| OrgError::config("AWS_SECRET_ACCESS_KEY not set"))?;
        if id.is_empty() || secret.is_empty() {
            return Err(OrgError::config("AWS credentials in environment are empty"));
        }
        let mut c = Self::permanent(id, secret).with_source("env");
        if let Ok(token) = std::env::var("AWS_SESSION_TOKEN") {
            c.session_token = token;
        }
        Ok(c)
    }

    /// Returns true if these credentials remain usable for `d` after `now`,
    /// keeping `margin` in reserve before the real expiry.
    pub fn valid_for(&self, now: DateTime<Utc>, d: Duration, margin: Duration) -> bool {
        if !self.can_expire {
            return true;
        }
        let Some(expires) = self.expires else {
            return false;
        };
        // A window too large to represent is never covered
        d.checked_add(margin)
            .and_then(|need| chrono::Duration::from_std(need).ok())
            .and_then(|need| now.checked_add_signed(need))
            .is_some_and(|end| end <= expires)
    }
}

impl fmt::Debug for Creds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Creds")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &if self.session_token.is_empty() { "" } else { "<redacted>" })
            .field("can_expire", &self.can_expire)
            .field("expires", &self.expires)
            .field("source", &self.source)
            .finish()
    }
}

/// Requested lifetime for [`Provider::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Credentials must stay valid at least this long from now
    For(Duration),
    /// Renew unconditionally
    Renew,
}

impl From<Duration> for Validity {
    fn from(d: Duration) -> Self {
        Validity::For(d)
    }
}

/// Source of fresh credentials.
#[async_trait]
pub trait Renew: Send + Sync {
    async fn renew(&self) -> Result<Creds>;
}

#[async_trait]
impl<F, Fut> Renew for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Creds>> + Send + 'static,
{
    async fn renew(&self) -> Result<Creds> {
        (self)().await
    }
}

/// Result of one renewal attempt. Never mutated after creation.
///
/// For a failure, `creds` is empty apart from the synthetic expiry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub creds: Creds,
    pub err: Option<OrgError>,
}

impl Snapshot {
    fn result(&self) -> Result<Creds> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(self.creds.clone()),
        }
    }
}

/// Caching credentials provider.
pub struct Provider {
    renewer: Arc<dyn Renew>,
    cache: RwLock<Option<Arc<Snapshot>>>,
    renew_lock: tokio::sync::Mutex<()>,
    margin: Duration,
    clock: SharedClock,
}

impl Provider {
    pub fn new(renewer: impl Renew + 'static) -> Self {
        Self::from_arc(Arc::new(renewer))
    }

    pub fn from_arc(renewer: Arc<dyn Renew>) -> Self {
        Self {
            renewer,
            cache: RwLock::new(None),
            renew_lock: tokio::sync::Mutex::new(()),
            margin: DEFAULT_MARGIN,
            clock: clock::system(),
        }
    }

    /// Provider for credentials that are known up front and never renewed.
    pub fn fixed(creds: Creds) -> Self {
        let c = creds.clone();
        let p = Self::new(move || {
            let c = c.clone();
            async move { Ok::<_, OrgError>(c) }
        });
        p.store(Ok(creds));
        p
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Current cached credentials without blocking or renewing.
    pub fn creds(&self) -> Result<Creds> {
        match self.load() {
            Some(snap) => snap.result(),
            None => Err(OrgError::no_access("no credentials")),
        }
    }

    /// Latest snapshot, if any renewal or store has happened.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.load()
    }

    /// Same as `ensure(1 minute)`.
    pub async fn retrieve(&self) -> Result<Creds> {
        self.ensure(DEFAULT_VALIDITY).await
    }

    /// Makes sure the cache holds credentials valid for the requested time,
    /// renewing at most once.
    pub async fn ensure(&self, validity: impl Into<Validity>) -> Result<Creds> {
        let validity = validity.into();
        if let Some(r) = self.cached_for(validity) {
            return r;
        }

        let _guard = self.renew_lock.lock().await;
        // Another caller may have renewed while we waited
        if let Some(r) = self.cached_for(validity) {
            return r;
        }

        let result = self.renewer.renew().await;
        match &result {
            Ok(c) => tracing::debug!(source = %c.source, expires = ?c.expires, "renewed credentials"),
            Err(e) => tracing::warn!(error = %e, "credential renewal failed"),
        }
        let snap = self.put(result);
        match validity {
            Validity::Renew => snap.result(),
            Validity::For(d) => self.check(&snap, d),
        }
    }

    /// Unconditionally replace the cached value.
    pub fn store(&self, result: Result<Creds>) {
        self.put(result);
    }

    /// Put back a snapshot captured earlier, keeping its expiry.
    pub fn restore(&self, snap: Snapshot) {
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(snap));
    }

    fn cached_for(&self, validity: Validity) -> Option<Result<Creds>> {
        let Validity::For(d) = validity else {
            return None;
        };
        let snap = self.load()?;
        let now = self.clock.now();
        let fresh = match &snap.err {
            // Cached failures hold until their synthetic expiry, whatever `d` is
            Some(_) => snap.creds.expires.is_some_and(|e| now < e),
            None => snap.creds.valid_for(now, d, self.margin),
        };
        fresh.then(|| self.check(&snap, d))
    }

    fn check(&self, snap: &Snapshot, d: Duration) -> Result<Creds> {
        let creds = snap.result()?;
        if !creds.valid_for(self.clock.now(), d, self.margin) {
            return Err(OrgError::Unable { want: d });
        }
        Ok(creds)
    }

    fn put(&self, result: Result<Creds>) -> Arc<Snapshot> {
        let snap = Arc::new(match result {
            Ok(creds) => Snapshot { creds, err: None },
            Err(e) => {
                let backoff = if e.is_throttle() { THROTTLE_BACKOFF } else { ERROR_BACKOFF };
                let expires = chrono::Duration::from_std(backoff)
                    .ok()
                    .map(|b| self.clock.now() + b);
                Snapshot {
                    creds: Creds {
                        can_expire: true,
                        expires,
                        ..Creds::default()
                    },
                    err: Some(e),
                }
            }
        });
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(snap.clone());
        snap
    }

    fn load(&self) -> Option<Arc<Snapshot>> {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("cache", &self.load())
            .field("margin", &self.margin)
            .finish()
    }
}
