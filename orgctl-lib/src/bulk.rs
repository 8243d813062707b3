//! Bulk operations over many accounts
//!
//! [`run`] fans an async operation out to one task per account, bounded by a
//! semaphore, and collects every result. A failure in one account never
//! cancels the others; a panicking task is reported as
//! [`OrgError::Task`] for its account.

use crate::account::Account;
use crate::control::ControlStore;
use crate::creds::{Creds, Validity};
use crate::ctl::Ctl;
use crate::{OrgError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Per-account outcome of a bulk operation, in input order.
pub type Outcome<T> = Vec<(Arc<Account>, Result<T>)>;

/// Run `op` for every account with at most `limit` in flight.
pub async fn run<T, F, Fut>(accounts: &[Arc<Account>], limit: usize, op: F) -> Outcome<T>
where
    T: Send + 'static,
    F: Fn(Arc<Account>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let op = Arc::new(op);
    let mut set = JoinSet::new();

    for (i, acct) in accounts.iter().enumerate() {
        let (sem, op, acct) = (sem.clone(), op.clone(), acct.clone());
        set.spawn(async move {
            let _permit = sem.acquire_owned().await;
            // The inner task isolates panics so the slot still gets a result
            let r = match tokio::spawn(op(acct)).await {
                Ok(r) => r,
                Err(e) => Err(OrgError::Task(e.to_string())),
            };
            (i, r)
        });
    }

    let mut slots: Vec<Option<Result<T>>> = accounts.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((i, r)) => slots[i] = Some(r),
            Err(e) => tracing::error!(error = %e, "bulk worker failed"),
        }
    }

    accounts
        .iter()
        .cloned()
        .zip(slots)
        .map(|(a, r)| {
            let r = r.unwrap_or_else(|| Err(OrgError::Task("worker did not report".to_string())));
            (a, r)
        })
        .collect()
}

/// Success and failure counts of one bulk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub ok: usize,
    pub failed: usize,
    /// Failures by [`OrgError::kind`]
    pub by_kind: BTreeMap<&'static str, usize>,
}

impl BatchReport {
    pub fn new<T>(outcome: &Outcome<T>) -> Self {
        let mut report = Self::default();
        for (_, r) in outcome {
            match r {
                Ok(_) => report.ok += 1,
                Err(e) => {
                    report.failed += 1;
                    *report.by_kind.entry(e.kind()).or_default() += 1;
                }
            }
        }
        report
    }

    /// Log the summary at info level.
    pub fn log(&self, op: &str) {
        tracing::info!(op, ok = self.ok, failed = self.failed, by_kind = ?self.by_kind, "bulk operation finished");
    }
}

/// Make sure every account has credentials valid for `validity`.
pub async fn ensure_creds(accounts: &[Arc<Account>], validity: Validity, limit: usize) -> Outcome<Creds> {
    let outcome = run(accounts, limit, move |acct| async move {
        let r = acct.creds().ensure(validity).await;
        acct.update(|s| s.set_creds(&r));
        r
    })
    .await;
    BatchReport::new(&outcome).log("ensure_creds");
    outcome
}

/// Load control records. Accounts without one come back as `NoCtl` and are
/// marked unmanaged.
pub async fn load_ctl(store: &Arc<ControlStore>, accounts: &[Arc<Account>], limit: usize) -> Outcome<Ctl> {
    let store = store.clone();
    let outcome = run(accounts, limit, move |acct| {
        let store = store.clone();
        async move { store.load(&acct).await }
    })
    .await;
    BatchReport::new(&outcome).log("load_ctl");
    outcome
}

/// Store local control edits.
pub async fn store_ctl(store: &Arc<ControlStore>, accounts: &[Arc<Account>], limit: usize) -> Outcome<()> {
    let store = store.clone();
    let outcome = run(accounts, limit, move |acct| {
        let store = store.clone();
        async move { store.store(&acct).await }
    })
    .await;
    BatchReport::new(&outcome).log("store_ctl");
    outcome
}
