//! Accounts and the in-memory account registry
//!
//! The [`Registry`] is the authoritative set of accounts this process knows
//! about. It is built explicitly at startup from a [`Proxy`] and handed to
//! whatever needs it; there is no global instance.
//!
//! Each [`Account`] keeps its mutable state (control record, last confirmed
//! record, status flags, last error) behind a short-lived lock that is never
//! held across an await point.

use crate::config::Config;
use crate::creds::{Creds, Provider};
use crate::ctl::Ctl;
use crate::proxy::Proxy;
use crate::{OrgError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

/// 12-digit account ID.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(s: &str) -> Result<Self> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(OrgError::invalid_input(format!("invalid account id: {s:?}")))
        }
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == 12 && s.bytes().all(|b| b.is_ascii_digit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccountId {
    type Err = OrgError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AccountId {
    type Error = OrgError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

/// Account status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Credentials were obtained and accepted
    #[serde(default)]
    pub creds_valid: bool,
    /// A load of the control record was attempted and completed
    #[serde(default)]
    pub ctl_loaded: bool,
    /// The control record exists and decoded cleanly
    #[serde(default)]
    pub ctl_valid: bool,
    /// Listed in the organization directory
    #[serde(default)]
    pub in_org: bool,
}

/// Mutable part of an account.
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    pub name: String,
    /// Desired (local) control record
    pub ctl: Option<Ctl>,
    /// Last control record confirmed on the remote store
    pub reference: Option<Ctl>,
    pub status: Status,
    /// Last error encountered while establishing access or control state
    pub err: Option<OrgError>,
    /// `err` came from obtaining credentials
    creds_err: bool,
}

impl AccountState {
    /// Forget any control record; the account is not under management.
    pub(crate) fn set_unmanaged(&mut self) {
        self.ctl = None;
        self.reference = None;
        self.status.ctl_loaded = true;
        self.status.ctl_valid = false;
        self.clear_err();
    }

    /// Record a control value confirmed on the remote store.
    pub(crate) fn set_confirmed(&mut self, ctl: Ctl) {
        self.ctl = Some(ctl.clone());
        self.reference = Some(ctl);
        self.status.ctl_loaded = true;
        self.status.ctl_valid = true;
        self.clear_err();
    }

    /// Record the outcome of obtaining credentials. Success clears an earlier
    /// credential error but leaves control record errors in place.
    pub(crate) fn set_creds(&mut self, r: &Result<Creds>) {
        self.status.creds_valid = r.is_ok();
        match r {
            Ok(_) if self.creds_err => self.clear_err(),
            Ok(_) => {}
            Err(e) => {
                self.err = Some(e.clone());
                self.creds_err = true;
            }
        }
    }

    /// Record a control record error.
    pub(crate) fn set_err(&mut self, e: OrgError) {
        self.err = Some(e);
        self.creds_err = false;
    }

    pub(crate) fn clear_err(&mut self) {
        self.err = None;
        self.creds_err = false;
    }
}

/// One member account.
pub struct Account {
    id: AccountId,
    creds: Arc<Provider>,
    state: Mutex<AccountState>,
}

impl Account {
    pub fn new(id: AccountId, name: impl Into<String>, creds: Arc<Provider>) -> Self {
        Self {
            id,
            creds,
            state: Mutex::new(AccountState {
                name: name.into(),
                ..AccountState::default()
            }),
        }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    pub fn creds(&self) -> &Arc<Provider> {
        &self.creds
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Copy of the current state.
    pub fn state(&self) -> AccountState {
        self.lock().clone()
    }

    pub fn ctl(&self) -> Option<Ctl> {
        self.lock().ctl.clone()
    }

    pub fn reference(&self) -> Option<Ctl> {
        self.lock().reference.clone()
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn err(&self) -> Option<OrgError> {
        self.lock().err.clone()
    }

    /// True if access or control state could not be established.
    pub fn has_error(&self) -> bool {
        self.lock().err.is_some()
    }

    /// True if a valid control record is loaded.
    pub fn is_managed(&self) -> bool {
        let s = self.lock();
        s.status.ctl_valid && s.ctl.is_some()
    }

    /// Edit the desired control record. Fails with `NoCtl` if the account is
    /// not under management.
    pub fn edit_ctl<R>(&self, f: impl FnOnce(&mut Ctl) -> R) -> Result<R> {
        let mut s = self.lock();
        match s.ctl.as_mut() {
            Some(ctl) => Ok(f(ctl)),
            None => Err(OrgError::NoCtl(self.id.to_string())),
        }
    }

    /// Apply `f` to the state under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut AccountState) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.lock();
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &s.name)
            .field("ctl", &s.ctl)
            .field("status", &s.status)
            .finish()
    }
}

/// Account listing from the organization directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: AccountId,
    pub name: String,
}

/// In-memory account registry.
pub struct Registry {
    proxy: Arc<Proxy>,
    config: Config,
    accounts: RwLock<BTreeMap<AccountId, Arc<Account>>>,
}

impl Registry {
    pub fn new(proxy: Arc<Proxy>, config: Config) -> Self {
        Self {
            proxy,
            config,
            accounts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register an account, or rename it if already known.
    pub fn register(&self, id: AccountId, name: &str) -> Arc<Account> {
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(a) = accounts.get(&id) {
            if !name.is_empty() {
                a.update(|s| s.name = name.to_string());
            }
            return a.clone();
        }
        let role = self.proxy.account_role(&id);
        let creds = self.proxy.provider(role, self.config.session_duration);
        let account = Arc::new(Account::new(id.clone(), name, creds));
        tracing::debug!(account = %id, name, "registered account");
        accounts.insert(id, account.clone());
        account
    }

    pub fn deregister(&self, id: &AccountId) -> Option<Arc<Account>> {
        self.accounts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn get(&self, id: &AccountId) -> Option<Arc<Account>> {
        self.read().get(id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Account>> {
        self.read().values().find(|a| a.name() == name).cloned()
    }

    /// All accounts ordered by ID.
    pub fn all(&self) -> Vec<Arc<Account>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Merge a directory listing. New accounts are registered; the
    /// in-organization flag is set for listed accounts and cleared for the
    /// rest. Returns the number of newly registered accounts.
    pub fn update_directory(&self, entries: &[DirectoryEntry]) -> usize {
        let before = self.len();
        for e in entries {
            self.register(e.id.clone(), &e.name);
        }
        for a in self.all() {
            let listed = entries.iter().any(|e| &e.id == a.id());
            a.update(|s| s.status.in_org = listed);
        }
        let added = self.len() - before;
        tracing::info!(listed = entries.len(), added, "directory updated");
        added
    }

    /// Apply local account aliases, registering unknown IDs.
    pub fn apply_aliases(&self, aliases: &BTreeMap<AccountId, String>) {
        for (id, name) in aliases {
            self.register(id.clone(), name);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<AccountId, Arc<Account>>> {
        self.accounts.read().unwrap_or_else(|e| e.into_inner())
    }
}
