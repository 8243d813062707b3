//! In-process cloud
//!
//! [`MemoryCloud`] implements [`Sts`] and [`Iam`] against in-memory state.
//! It models the parts of the real services that matter to the control plane:
//!
//! - credentials are checked on every call and scoped to one account
//! - role assumption can be denied, throttled, or gated on an external ID
//! - reads are eventually consistent: a write becomes visible to `get_role`
//!   only after the configured lag, while writes always apply to the latest
//!   value and echo it back
//!
//! The last point is what makes lost updates between racing claimants
//! observable, which is what the race harness measures.

use crate::account::AccountId;
use crate::arn::Arn;
use crate::clock::{self, SharedClock};
use crate::cloud::{AssumeRole, CallerIdentity, Iam, NewRole, Role, Sts, ENTITY_EXISTS, NO_SUCH_ENTITY};
use crate::creds::Creds;
use crate::{OrgError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Access key of the base identity issued by [`MemoryCloud::base_creds`].
const BASE_KEY: &str = "AKIAMEMORYBASE";

/// Number of calls made to each operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get_caller_identity: usize,
    pub assume_role: usize,
    pub create_role: usize,
    pub get_role: usize,
    pub update_role: usize,
    pub delete_role: usize,
}

struct Version {
    at: Instant,
    role: Option<Role>,
}

/// Who an issued access key belongs to.
struct Session {
    account: String,
    role_arn: Arn,
    session_name: String,
}

#[derive(Default)]
struct CloudState {
    roles: HashMap<(AccountId, String), Vec<Version>>,
    sessions: HashMap<String, Session>,
    denied: HashSet<String>,
    required_external_id: Option<String>,
    throttle_next: usize,
    tamper_next_echo: bool,
    next_key: u64,
    calls: CallCounts,
}

/// In-memory STS and IAM.
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    identity: CallerIdentity,
    lag: Duration,
    latency: Duration,
    session_lifetime: Duration,
    clock: SharedClock,
}

impl MemoryCloud {
    /// Cloud whose base identity is the IAM user `admin` in account
    /// 000000000000.
    pub fn new() -> Self {
        let arn = Arn {
            partition: "aws".to_string(),
            service: "iam".to_string(),
            region: String::new(),
            account: "000000000000".to_string(),
            resource: "user/admin".to_string(),
        };
        Self {
            state: Mutex::new(CloudState::default()),
            identity: CallerIdentity {
                account: arn.account.clone(),
                arn,
                user_id: "AIDAMEMORYADMIN".to_string(),
            },
            lag: Duration::ZERO,
            latency: Duration::ZERO,
            session_lifetime: Duration::from_secs(3600),
            clock: clock::system(),
        }
    }

    /// Identity returned for the base credentials.
    pub fn with_identity(mut self, identity: CallerIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Delay before a write becomes visible to reads.
    pub fn with_lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }

    /// Delay added to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Lifetime of assumed-role credentials when no duration is requested.
    pub fn with_session_lifetime(mut self, d: Duration) -> Self {
        self.session_lifetime = d;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Permanent credentials of the base identity.
    pub fn base_creds(&self) -> Creds {
        Creds::permanent(BASE_KEY, "memory-secret").with_source("memory")
    }

    /// Refuse role assumption into `account`.
    pub fn deny(&self, account: &AccountId) {
        self.lock().denied.insert(account.to_string());
    }

    pub fn allow(&self, account: &AccountId) {
        self.lock().denied.remove(account.as_str());
    }

    /// Require this external ID on every role assumption.
    pub fn require_external_id(&self, id: Option<String>) {
        self.lock().required_external_id = id;
    }

    /// Fail the next `n` role assumptions with a throttling error.
    pub fn throttle_next(&self, n: usize) {
        self.lock().throttle_next = n;
    }

    /// Make the next description update echo something other than what was
    /// written.
    pub fn tamper_next_echo(&self) {
        self.lock().tamper_next_echo = true;
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Latest value of a role, ignoring propagation lag.
    pub fn role(&self, account: &AccountId, name: &str) -> Option<Role> {
        self.lock()
            .roles
            .get(&(account.clone(), name.to_string()))
            .and_then(|h| h.last())
            .and_then(|v| v.role.clone())
    }

    /// Out-of-band description change, as another operator would make.
    pub fn set_role_description(&self, account: &AccountId, name: &str, description: &str) -> Result<()> {
        let mut st = self.lock();
        let mut role = latest(&st, account, name)
            .ok_or_else(|| OrgError::api(NO_SUCH_ENTITY, format!("role {name} not found")))?;
        role.description = description.to_string();
        push(&mut st, self.lag, account, name, Some(role));
        Ok(())
    }

    /// Out-of-band role deletion.
    pub fn remove_role(&self, account: &AccountId, name: &str) {
        let mut st = self.lock();
        if latest(&st, account, name).is_some() {
            push(&mut st, self.lag, account, name, None);
        }
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check that `creds` may act inside `account`.
    fn authorize(st: &CloudState, account: &AccountId, creds: &Creds) -> Result<()> {
        match st.sessions.get(&creds.access_key_id) {
            Some(s) if s.account == account.as_str() => Ok(()),
            Some(_) => Err(OrgError::api("AccessDenied", "credentials belong to another account")),
            None => Err(OrgError::api("InvalidClientTokenId", "unknown access key")),
        }
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

fn latest(st: &CloudState, account: &AccountId, name: &str) -> Option<Role> {
    st.roles
        .get(&(account.clone(), name.to_string()))
        .and_then(|h| h.last())
        .and_then(|v| v.role.clone())
}

fn push(st: &mut CloudState, lag: Duration, account: &AccountId, name: &str, role: Option<Role>) {
    let now = Instant::now();
    let history = st.roles.entry((account.clone(), name.to_string())).or_default();
    history.push(Version { at: now, role });
    settle(history, now, lag);
}

/// Drop versions shadowed by a newer propagated one. Returns the visible
/// version, which is then at the front, if any has propagated.
fn settle(history: &mut Vec<Version>, now: Instant, lag: Duration) -> Option<&Version> {
    let i = history.iter().rposition(|v| v.at + lag <= now)?;
    history.drain(..i);
    history.first()
}

#[async_trait]
impl Sts for MemoryCloud {
    async fn get_caller_identity(&self, creds: &Creds) -> Result<CallerIdentity> {
        self.delay().await;
        let mut st = self.lock();
        st.calls.get_caller_identity += 1;
        if creds.access_key_id == BASE_KEY {
            return Ok(self.identity.clone());
        }
        let s = st
            .sessions
            .get(&creds.access_key_id)
            .ok_or_else(|| OrgError::api("InvalidClientTokenId", "unknown access key"))?;
        let arn = Arn {
            partition: s.role_arn.partition.clone(),
            service: "sts".to_string(),
            region: String::new(),
            account: s.account.clone(),
            resource: format!("assumed-role/{}/{}", s.role_arn.name(), s.session_name),
        };
        Ok(CallerIdentity {
            account: s.account.clone(),
            arn,
            user_id: format!("AROAMEMORY:{}", s.session_name),
        })
    }

    async fn assume_role(&self, creds: &Creds, req: &AssumeRole) -> Result<Creds> {
        self.delay().await;
        let mut st = self.lock();
        st.calls.assume_role += 1;
        if creds.access_key_id != BASE_KEY && !st.sessions.contains_key(&creds.access_key_id) {
            return Err(OrgError::api("InvalidClientTokenId", "unknown access key"));
        }
        if st.throttle_next > 0 {
            st.throttle_next -= 1;
            return Err(OrgError::api("Throttling", "Rate exceeded"));
        }
        let account = req.role_arn.account.clone();
        if st.denied.contains(&account) {
            return Err(OrgError::api(
                "AccessDenied",
                format!("not authorized to assume {}", req.role_arn),
            ));
        }
        if let Some(want) = &st.required_external_id {
            if req.external_id.as_deref() != Some(want.as_str()) {
                return Err(OrgError::api("AccessDenied", "external ID mismatch"));
            }
        }
        st.next_key += 1;
        let key = format!("ASIAMEMORY{:08}", st.next_key);
        st.sessions.insert(
            key.clone(),
            Session {
                account,
                role_arn: req.role_arn.clone(),
                session_name: req.session_name.clone(),
            },
        );
        let lifetime = req.duration.unwrap_or(self.session_lifetime);
        let expires = self.clock.now()
            + chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::hours(1));
        Ok(Creds::temporary(key, "memory-secret", "memory-token", expires))
    }
}

#[async_trait]
impl Iam for MemoryCloud {
    async fn create_role(&self, account: &AccountId, creds: &Creds, role: &NewRole) -> Result<Role> {
        self.delay().await;
        let mut st = self.lock();
        st.calls.create_role += 1;
        Self::authorize(&st, account, creds)?;
        if latest(&st, account, &role.name).is_some() {
            return Err(OrgError::api(
                ENTITY_EXISTS,
                format!("Role with name {} already exists.", role.name),
            ));
        }
        let created = Role {
            arn: Arn::role("aws", account.as_str(), &role.path, &role.name),
            path: role.path.clone(),
            name: role.name.clone(),
            description: role.description.clone(),
        };
        push(&mut st, self.lag, account, &role.name, Some(created.clone()));
        Ok(created)
    }

    async fn get_role(&self, account: &AccountId, creds: &Creds, name: &str) -> Result<Option<Role>> {
        self.delay().await;
        let mut st = self.lock();
        st.calls.get_role += 1;
        Self::authorize(&st, account, creds)?;
        let now = Instant::now();
        let lag = self.lag;
        let Some(history) = st.roles.get_mut(&(account.clone(), name.to_string())) else {
            return Ok(None);
        };
        Ok(settle(history, now, lag).and_then(|v| v.role.clone()))
    }

    async fn update_role_description(
        &self,
        account: &AccountId,
        creds: &Creds,
        name: &str,
        description: &str,
    ) -> Result<Role> {
        self.delay().await;
        let mut st = self.lock();
        st.calls.update_role += 1;
        Self::authorize(&st, account, creds)?;
        let mut role = latest(&st, account, name)
            .ok_or_else(|| OrgError::api(NO_SUCH_ENTITY, format!("role {name} not found")))?;
        role.description = description.to_string();
        push(&mut st, self.lag, account, name, Some(role.clone()));
        if std::mem::take(&mut st.tamper_next_echo) {
            role.description.push('~');
        }
        Ok(role)
    }

    async fn delete_role(&self, account: &AccountId, creds: &Creds, name: &str) -> Result<()> {
        self.delay().await;
        let mut st = self.lock();
        st.calls.delete_role += 1;
        Self::authorize(&st, account, creds)?;
        if latest(&st, account, name).is_none() {
            return Err(OrgError::api(NO_SUCH_ENTITY, format!("role {name} not found")));
        }
        push(&mut st, self.lag, account, name, None);
        Ok(())
    }
}
