//! Persisted sessions
//!
//! A session lets a short-lived process (one CLI invocation) pick up where the
//! previous one stopped: the resolved base identity, the organization, every
//! account with its confirmed control record, and any credentials that are
//! still worth keeping. Restoring a session makes no remote calls.

use crate::account::{AccountId, Registry, Status};
use crate::cloud::{CallerIdentity, Sts};
use crate::config::Config;
use crate::creds::{Creds, Provider, Snapshot};
use crate::ctl::Ctl;
use crate::proxy::{OrgInfo, Proxy};
use crate::{OrgError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Current session format version.
pub const SESSION_VERSION: u32 = 1;

/// Cached credentials (or a cached failure) of one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredsEntry {
    pub account_id: AccountId,
    /// For a failure, only the expiry is meaningful
    pub creds: Creds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub id: AccountId,
    pub name: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctl: Option<Ctl>,
}

/// Serializable control plane state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub ident: CallerIdentity,
    pub session_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<OrgInfo>,
    #[serde(default)]
    pub creds: Vec<CredsEntry>,
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,
}

impl SessionState {
    /// Snapshot the registry.
    ///
    /// Credentials are kept only if they stay valid for the configured
    /// session margin; cached failures are kept until their backoff expires.
    /// Local control edits that were never stored are not captured, only
    /// confirmed records are.
    pub fn capture(registry: &Registry, org: Option<&OrgInfo>) -> Self {
        let proxy = registry.proxy();
        let now = proxy.clock().now();
        let margin = registry.config().session_margin;

        let mut creds = Vec::new();
        let mut accounts = Vec::new();
        for a in registry.all() {
            if let Some(snap) = a.creds().snapshot() {
                let keep = match &snap.err {
                    Some(_) => snap.creds.expires.is_some_and(|e| now < e),
                    None => snap.creds.valid_for(now, margin, Duration::ZERO),
                };
                if keep {
                    creds.push(CredsEntry {
                        account_id: a.id().clone(),
                        creds: snap.creds.clone(),
                        error: snap.err.as_ref().map(|e| e.to_string()),
                    });
                }
            }
            let s = a.state();
            accounts.push(AccountEntry {
                id: a.id().clone(),
                name: s.name,
                status: s.status,
                ctl: s.reference,
            });
        }

        Self {
            version: SESSION_VERSION,
            ident: proxy.ident().clone(),
            session_name: proxy.session_name().to_string(),
            org: org.cloned(),
            creds,
            accounts,
        }
    }

    /// Rebuild the proxy without remote calls.
    pub fn proxy(&self, sts: Arc<dyn Sts>, base: Arc<Provider>, config: Config) -> Proxy {
        let proxy = Proxy::restore(sts, base, self.ident.clone(), self.session_name.clone(), config);
        if let Some(org) = &self.org {
            proxy.set_org(org);
        }
        proxy
    }

    /// Register all accounts into `registry` and seed their credential
    /// caches. The restored control record becomes both the local and the
    /// reference value.
    pub fn restore(&self, registry: &Registry) {
        for e in &self.accounts {
            let a = registry.register(e.id.clone(), &e.name);
            a.update(|s| {
                s.status = e.status;
                s.ctl = e.ctl.clone();
                s.reference = e.ctl.clone();
                s.clear_err();
            });
        }
        for e in &self.creds {
            let a = registry.register(e.account_id.clone(), "");
            a.creds().restore(Snapshot {
                creds: e.creds.clone(),
                err: e.error.clone().map(OrgError::Cached),
            });
            if let Some(msg) = &e.error {
                a.update(|s| s.set_creds(&Err(OrgError::Cached(msg.clone()))));
            }
        }
        tracing::debug!(
            accounts = self.accounts.len(),
            creds = self.creds.len(),
            "session restored"
        );
    }
}

/// Session persisted as a JSON file, readable only by its owner.
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` if no session was saved.
    pub async fn load(&self) -> Result<Option<SessionState>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: SessionState = serde_json::from_slice(&data)?;
        if state.version != SESSION_VERSION {
            return Err(OrgError::invalid_input(format!(
                "unsupported session version {} in {}",
                state.version,
                self.path.display()
            )));
        }
        Ok(Some(state))
    }

    /// Write atomically with 0600 permissions.
    pub async fn save(&self, state: &SessionState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to temp file first, then rename (atomic on Unix)
        let temp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&temp_path, perms)?;
        }

        tokio::fs::rename(&temp_path, &self.path).await?;

        #[cfg(unix)]
        {
            if let Some(parent) = self.path.parent() {
                if let Ok(dir) = tokio::fs::File::open(parent).await {
                    let _ = dir.sync_all().await;
                }
            }
        }

        tracing::debug!(path = %self.path.display(), "session saved");
        Ok(())
    }

    /// Remove the session. Succeeds if there is none.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
