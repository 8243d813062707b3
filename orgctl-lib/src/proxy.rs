//! Credential proxy
//!
//! Every credential orgctl uses is derived from one base ("gateway") identity.
//! The [`Proxy`] resolves who that identity is, picks a deterministic session
//! name for it, and hands out [`Provider`]s that assume roles in member
//! accounts on demand.
//!
//! Role assumptions carry an organization-specific external ID. It is not a
//! secret; it lets a role's trust policy refuse assumption requests that were
//! issued on behalf of some other organization (confused deputy).

use crate::account::AccountId;
use crate::arn::Arn;
use crate::clock::{self, SharedClock};
use crate::cloud::{AssumeRole, CallerIdentity, Sts};
use crate::config::Config;
use crate::creds::{Creds, Provider, Validity, DEFAULT_VALIDITY};
use crate::{retry, OrgError, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Session name used when the base identity is an account root.
pub const ROOT_SESSION_NAME: &str = "root";

/// Organization facts needed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgInfo {
    pub id: String,
    pub master_account_id: String,
    pub master_account_email: String,
}

/// Session name for role assumptions made on behalf of `ident`.
///
/// Assumed roles and federated users keep their existing session name (the
/// part of the unique ID after ':'). IAM users use their user name.
pub fn session_name(ident: &CallerIdentity) -> String {
    if let Some((_, s)) = ident.user_id.split_once(':') {
        if !s.is_empty() {
            return s.to_string();
        }
    }
    if ident.arn.resource_type() == "user" {
        return ident.arn.name().to_string();
    }
    ROOT_SESSION_NAME.to_string()
}

/// Hex HMAC-SHA256 of `"<namespace>:<master id>:<master email>"` keyed by
/// the organization ID.
pub fn external_id(org: &OrgInfo, namespace: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = Hmac::<Sha256>::new_from_slice(org.id.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC key length is unrestricted"));
    mac.update(
        format!(
            "{}:{}:{}",
            namespace, org.master_account_id, org.master_account_email
        )
        .as_bytes(),
    );
    hex::encode(mac.finalize().into_bytes())
}

/// Derives per-role credential providers from one base identity.
pub struct Proxy {
    sts: Arc<dyn Sts>,
    base: Arc<Provider>,
    ident: CallerIdentity,
    session_name: String,
    external_id: Arc<RwLock<Option<String>>>,
    config: Config,
    clock: SharedClock,
}

impl Proxy {
    /// Resolve the base identity and build a proxy for it.
    pub async fn new(sts: Arc<dyn Sts>, base: Arc<Provider>, config: Config) -> Result<Self> {
        let creds = base.retrieve().await?;
        let ident = sts.get_caller_identity(&creds).await?;
        let session_name = session_name(&ident);
        tracing::info!(arn = %ident.arn, session = %session_name, "resolved base identity");
        Ok(Self::restore(sts, base, ident, session_name, config))
    }

    /// Rebuild a proxy from a previously resolved identity without any
    /// remote calls.
    pub fn restore(
        sts: Arc<dyn Sts>,
        base: Arc<Provider>,
        ident: CallerIdentity,
        session_name: String,
        config: Config,
    ) -> Self {
        Self {
            sts,
            base,
            ident,
            session_name,
            external_id: Arc::new(RwLock::new(None)),
            config,
            clock: clock::system(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn ident(&self) -> &CallerIdentity {
        &self.ident
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn base(&self) -> &Arc<Provider> {
        &self.base
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Use the external ID of `org` for every role assumption from now on,
    /// including providers created earlier.
    pub fn set_org(&self, org: &OrgInfo) {
        let id = external_id(org, &self.config.namespace);
        *self.external_id.write().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    pub fn external_id(&self) -> Option<String> {
        self.external_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// ARN of the access role in a member account.
    pub fn account_role(&self, account: &AccountId) -> Arn {
        Arn::role(
            &self.ident.arn.partition,
            account.as_str(),
            "/",
            &self.config.account_role,
        )
    }

    /// Provider that assumes `role` with the base credentials.
    pub fn provider(&self, role: Arn, duration: Option<Duration>) -> Arc<Provider> {
        let sts = self.sts.clone();
        let base = self.base.clone();
        let external_id = self.external_id.clone();
        let req = AssumeRole {
            role_arn: role,
            session_name: self.session_name.clone(),
            external_id: None,
            duration,
        };
        // The base must outlive the session it signs for
        let need = duration.unwrap_or(DEFAULT_VALIDITY);
        let renew = move || {
            let (sts, base, mut req) = (sts.clone(), base.clone(), req.clone());
            req.external_id = external_id.read().unwrap_or_else(|e| e.into_inner()).clone();
            async move {
                let creds = base.ensure(need).await?;
                let out = sts.assume_role(&creds, &req).await?;
                Ok::<_, OrgError>(out.with_source(req.role_arn.to_string()))
            }
        };
        Arc::new(
            Provider::new(renew)
                .with_margin(self.config.expiry_margin)
                .with_clock(self.clock.clone()),
        )
    }

    /// Wait up to `timeout` until a provider for a newly created account
    /// stops failing with `NoAccess`.
    pub async fn wait_usable(&self, provider: &Provider, timeout: Duration) -> Result<Creds> {
        retry::until(
            timeout,
            self.config.poll_interval,
            || async move {
                match provider.ensure(Validity::Renew).await {
                    Ok(c) => Ok(Some(c)),
                    Err(e) if e.is_no_access() => Ok(None),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }
}
