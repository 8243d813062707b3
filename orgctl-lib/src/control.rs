//! Control record storage
//!
//! Each managed account holds its [`Ctl`] in the description of a dedicated
//! IAM role. The role's trust policy denies everyone, so it grants nothing; it
//! is only a place to keep a small, account-local, eventually consistent
//! value.
//!
//! There is no compare-and-swap on a role description. Writers coordinate
//! optimistically instead: every account remembers the last value it
//! confirmed remotely (`reference`), a write merges local edits into the
//! current remote value, and ownership changes are refused when someone else
//! changed the owner since our reference. Because reads may be stale, a claim
//! is only trustworthy after [`ControlStore::confirm`] re-reads it following
//! a propagation delay.

use crate::account::Account;
use crate::cloud::{Iam, NewRole, ENTITY_EXISTS, NO_SUCH_ENTITY};
use crate::config::Config;
use crate::creds::Creds;
use crate::ctl::Ctl;
use crate::{retry, OrgError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Trust policy of the control role. Nobody may assume it.
pub const DENY_ALL_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Deny","Principal":{"AWS":"*"},"Action":"sts:AssumeRole"}]}"#;

/// Reads and writes control records.
pub struct ControlStore {
    iam: Arc<dyn Iam>,
    config: Config,
}

impl ControlStore {
    pub fn new(iam: Arc<dyn Iam>, config: Config) -> Self {
        Self { iam, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Put an unmanaged account under management with `ctl` as its initial
    /// record. Fails with [`OrgError::CtlExists`] if a record is already
    /// there, and returns only once the new record is readable.
    pub async fn init(&self, acct: &Account, ctl: &Ctl) -> Result<()> {
        let creds = self.access(acct).await?;
        let role = NewRole {
            path: self.config.ctl_path.clone(),
            name: self.config.ctl_name.clone(),
            assume_role_policy: DENY_ALL_POLICY.to_string(),
            description: ctl.encode()?,
        };
        match self.iam.create_role(acct.id(), &creds, &role).await {
            Ok(_) => {}
            Err(e) if e.code() == Some(ENTITY_EXISTS) => {
                return Err(OrgError::CtlExists(acct.id().to_string()));
            }
            Err(e) => return Err(self.fail(acct, e)),
        }

        let creds = &creds;
        retry::until(
            self.config.propagation_timeout,
            self.config.poll_interval,
            || async move {
                let role = self.iam.get_role(acct.id(), creds, &self.config.ctl_name).await?;
                Ok(role.map(|_| ()))
            },
        )
        .await
        .map_err(|e| self.fail(acct, e))?;

        acct.update(|s| s.set_confirmed(ctl.clone()));
        info!(account = %acct.id(), ctl = %ctl, "account under management");
        Ok(())
    }

    /// Read the current record and make it both the local and reference
    /// value. A missing record marks the account unmanaged and returns
    /// [`OrgError::NoCtl`].
    pub async fn load(&self, acct: &Account) -> Result<Ctl> {
        let creds = self.access(acct).await?;
        match self.read(acct, &creds).await? {
            Some(ctl) => {
                acct.update(|s| s.set_confirmed(ctl.clone()));
                debug!(account = %acct.id(), ctl = %ctl, "loaded control record");
                Ok(ctl)
            }
            None => Err(self.vanished(acct)),
        }
    }

    /// Write local edits.
    ///
    /// The local record is merged into the current remote one relative to
    /// the last confirmed reference. If the merge changes the owner while the
    /// remote owner has already moved away from our reference, nothing is
    /// written and [`OrgError::CtlUpdate`] is returned; the reference is
    /// advanced to the remote value so the caller can re-decide. A successful
    /// write is verified against the echoed value.
    pub async fn store(&self, acct: &Account) -> Result<()> {
        let (want, reference) = {
            let s = acct.state();
            (s.ctl, s.reference.unwrap_or_default())
        };
        let want = want.ok_or_else(|| OrgError::NoCtl(acct.id().to_string()))?;

        let creds = self.access(acct).await?;
        let Some(cur) = self.read(acct, &creds).await? else {
            return Err(self.vanished(acct));
        };

        let merged = want.merge(&cur, &reference);
        if merged == cur {
            debug!(account = %acct.id(), "control record already up to date");
            acct.update(|s| s.set_confirmed(cur));
            return Ok(());
        }

        if merged.owner != cur.owner && cur.owner != reference.owner {
            warn!(
                account = %acct.id(),
                expected = reference.owner().unwrap_or("-"),
                found = cur.owner().unwrap_or("-"),
                "owner changed concurrently"
            );
            let msg = format!(
                "owner of {} changed from {} to {}",
                acct.id(),
                reference.owner().unwrap_or("-"),
                cur.owner().unwrap_or("-")
            );
            acct.update(|s| s.reference = Some(cur));
            return Err(OrgError::ctl_update(msg));
        }

        let desc = merged.encode()?;
        let echoed = match self
            .iam
            .update_role_description(acct.id(), &creds, &self.config.ctl_name, &desc)
            .await
        {
            Ok(role) => role.description,
            Err(e) if e.code() == Some(NO_SUCH_ENTITY) => return Err(self.vanished(acct)),
            Err(e) => return Err(self.fail(acct, e)),
        };

        if echoed != desc {
            warn!(account = %acct.id(), "control record write was not echoed back");
            if let Ok(seen) = Ctl::decode(&echoed) {
                acct.update(|s| s.reference = Some(seen));
            }
            return Err(OrgError::ctl_update(format!(
                "write to {} was not confirmed by the service",
                acct.id()
            )));
        }

        info!(account = %acct.id(), ctl = %merged, "stored control record");
        acct.update(|s| s.set_confirmed(merged));
        Ok(())
    }

    /// Wait for writes to propagate, re-read, and check that `owner` still
    /// holds the account. Ownership is only reliable after this succeeds.
    pub async fn confirm(&self, acct: &Account, owner: &str) -> Result<()> {
        tokio::time::sleep(self.config.confirm_delay).await;
        let cur = self.load(acct).await?;
        if cur.owner() != Some(owner) {
            warn!(account = %acct.id(), owner, found = cur.owner().unwrap_or("-"), "claim lost");
            return Err(OrgError::ctl_update(format!(
                "{} is owned by {}, not {owner}",
                acct.id(),
                cur.owner().unwrap_or("nobody")
            )));
        }
        debug!(account = %acct.id(), owner, "ownership confirmed");
        Ok(())
    }

    /// Set the owner, store, and confirm.
    pub async fn claim(&self, acct: &Account, owner: &str) -> Result<()> {
        acct.edit_ctl(|c| c.owner = Some(owner.to_string()))?;
        self.store(acct).await?;
        self.confirm(acct, owner).await
    }

    /// Clear the owner and store.
    pub async fn release(&self, acct: &Account) -> Result<()> {
        acct.edit_ctl(|c| c.owner = None)?;
        self.store(acct).await
    }

    /// Take an account out of management. Succeeds if there was no record.
    pub async fn delete(&self, acct: &Account) -> Result<()> {
        let creds = self.access(acct).await?;
        match self
            .iam
            .delete_role(acct.id(), &creds, &self.config.ctl_name)
            .await
        {
            Ok(()) => info!(account = %acct.id(), "control record deleted"),
            Err(e) if e.code() == Some(NO_SUCH_ENTITY) => {
                debug!(account = %acct.id(), "no control record to delete")
            }
            Err(e) => return Err(self.fail(acct, e)),
        }
        acct.update(|s| s.set_unmanaged());
        Ok(())
    }

    /// Fetch and decode the remote record.
    async fn read(&self, acct: &Account, creds: &Creds) -> Result<Option<Ctl>> {
        let role = self
            .iam
            .get_role(acct.id(), creds, &self.config.ctl_name)
            .await
            .map_err(|e| self.fail(acct, e))?;
        let Some(role) = role else {
            return Ok(None);
        };
        match Ctl::decode(&role.description) {
            Ok(ctl) => Ok(Some(ctl)),
            Err(e) => {
                warn!(account = %acct.id(), error = %e, "undecodable control record");
                acct.update(|s| {
                    s.status.ctl_loaded = true;
                    s.status.ctl_valid = false;
                    s.set_err(e.clone());
                });
                Err(e)
            }
        }
    }

    /// Credentials for `acct`, recording the outcome on the account.
    async fn access(&self, acct: &Account) -> Result<Creds> {
        let r = acct.creds().retrieve().await;
        acct.update(|s| s.set_creds(&r));
        r
    }

    fn vanished(&self, acct: &Account) -> OrgError {
        info!(account = %acct.id(), "no control record, account is unmanaged");
        acct.update(|s| s.set_unmanaged());
        OrgError::NoCtl(acct.id().to_string())
    }

    fn fail(&self, acct: &Account, e: OrgError) -> OrgError {
        acct.update(|s| s.set_err(e.clone()));
        e
    }
}
