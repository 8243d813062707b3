//! Ownership race harness
//!
//! Several workers edit one account's control record at the same time
//! against an in-memory cloud with propagation lag. Each round reports how
//! many workers believed their edit landed (after store, and after the
//! confirmation re-read) versus what the record finally says.

use clap::Args;
use orgctl_lib::memory::MemoryCloud;
use orgctl_lib::{Account, AccountId, Config, ControlStore, Ctl, OrgError, Provider, Proxy, Registry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const ACCOUNT: &str = "123456789012";

#[derive(Args, Debug, Clone)]
pub struct RaceArgs {
    /// Workers racing per round
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Propagation lag of the simulated store in milliseconds
    #[arg(long, default_value_t = 200)]
    pub lag_ms: u64,

    /// Delay before each worker re-reads to confirm, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub confirm_ms: u64,

    /// Number of rounds
    #[arg(long, default_value_t = 5)]
    pub rounds: usize,

    /// Operation to race (claim, release, tag)
    #[arg(long, default_value = "claim")]
    pub op: String,
}

/// One raced operation: the starting record, the local edit each worker
/// makes, and whether a record still reflects a worker's edit.
pub struct Op {
    pub name: &'static str,
    initial: fn() -> Ctl,
    apply: fn(&mut Ctl, &str) -> orgctl_lib::Result<()>,
    holds: fn(&Ctl, &str) -> bool,
}

pub static OPS: &[Op] = &[
    Op {
        name: "claim",
        initial: Ctl::new,
        apply: |c, w| {
            c.owner = Some(w.to_string());
            Ok(())
        },
        holds: |c, w| c.owner() == Some(w),
    },
    Op {
        name: "release",
        initial: || Ctl::new().with_owner("previous"),
        apply: |c, _| {
            c.owner = None;
            Ok(())
        },
        holds: |c, _| c.owner.is_none(),
    },
    Op {
        name: "tag",
        initial: Ctl::new,
        apply: |c, w| c.set_tag(w, true),
        holds: |c, w| c.has_tag(w),
    },
];

pub fn find_op(name: &str) -> Option<&'static Op> {
    OPS.iter().find(|op| op.name == name)
}

/// Totals over all rounds.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RaceReport {
    pub op: String,
    pub rounds: usize,
    pub workers: usize,
    /// Stores that returned success
    pub stored: usize,
    /// Stores refused with a control update conflict
    pub conflicts: usize,
    /// Workers whose confirmation re-read still showed their edit
    pub confirmed: usize,
    /// Successful stores whose edit did not survive
    pub lost_after_store: usize,
    /// Confirmed edits that did not survive
    pub lost_after_confirm: usize,
}

struct WorkerResult {
    name: String,
    stored: bool,
    confirmed: bool,
}

struct Client {
    account: Arc<Account>,
    store: ControlStore,
}

async fn client(cloud: &Arc<MemoryCloud>, config: &Config) -> orgctl_lib::Result<Client> {
    let base = Arc::new(Provider::fixed(cloud.base_creds()));
    let proxy = Proxy::new(cloud.clone(), base, config.clone()).await?;
    let registry = Registry::new(Arc::new(proxy), config.clone());
    let account = registry.register(AccountId::parse(ACCOUNT)?, "race");
    Ok(Client {
        account,
        store: ControlStore::new(cloud.clone(), config.clone()),
    })
}

async fn worker(op: &Op, name: String, cloud: Arc<MemoryCloud>, config: Config) -> orgctl_lib::Result<WorkerResult> {
    let c = client(&cloud, &config).await?;
    c.store.load(&c.account).await?;
    c.account.edit_ctl(|ctl| (op.apply)(ctl, &name))??;

    let stored = match c.store.store(&c.account).await {
        Ok(()) => true,
        Err(OrgError::CtlUpdate(_)) => false,
        Err(e) => return Err(e),
    };
    let mut confirmed = false;
    if stored {
        tokio::time::sleep(config.confirm_delay).await;
        let seen = c.store.load(&c.account).await?;
        confirmed = (op.holds)(&seen, &name);
    }
    Ok(WorkerResult { name, stored, confirmed })
}

async fn round(op: &'static Op, args: &RaceArgs, config: &Config, report: &mut RaceReport) -> anyhow::Result<()> {
    let lag = Duration::from_millis(args.lag_ms);
    let cloud = Arc::new(
        MemoryCloud::new()
            .with_lag(lag)
            .with_latency(Duration::from_millis(5)),
    );
    let config = config
        .clone()
        .with_confirm_delay(Duration::from_millis(args.confirm_ms))
        .with_propagation(lag * 10 + Duration::from_secs(1), Duration::from_millis(50));

    let admin = client(&cloud, &config).await?;
    admin.store.init(&admin.account, &(op.initial)()).await?;

    let sem = Arc::new(Semaphore::new(config.concurrency));
    let mut set = JoinSet::new();
    for i in 0..args.workers {
        let (sem, cloud, config) = (sem.clone(), cloud.clone(), config.clone());
        set.spawn(async move {
            let _permit = sem.acquire_owned().await;
            worker(op, format!("w{i}"), cloud, config).await
        });
    }
    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        results.push(joined??);
    }

    tokio::time::sleep(lag).await;
    let last = admin.store.load(&admin.account).await?;
    tracing::debug!(ctl = %last, "round finished");

    for r in results {
        let survived = (op.holds)(&last, &r.name);
        report.stored += r.stored as usize;
        report.conflicts += !r.stored as usize;
        report.confirmed += r.confirmed as usize;
        report.lost_after_store += (r.stored && !survived) as usize;
        report.lost_after_confirm += (r.confirmed && !survived) as usize;
    }
    Ok(())
}

/// Run all rounds and return the totals.
pub async fn race(config: &Config, args: &RaceArgs) -> anyhow::Result<RaceReport> {
    let op = find_op(&args.op).ok_or_else(|| {
        let names: Vec<&str> = OPS.iter().map(|o| o.name).collect();
        anyhow::anyhow!("unknown op {:?}, expected one of {}", args.op, names.join(", "))
    })?;
    if args.workers == 0 {
        anyhow::bail!("at least one worker is required");
    }
    let mut report = RaceReport {
        op: op.name.to_string(),
        rounds: args.rounds,
        workers: args.workers,
        ..RaceReport::default()
    };
    for n in 0..args.rounds {
        round(op, args, config, &mut report).await?;
        tracing::info!(round = n + 1, stored = report.stored, lost = report.lost_after_confirm, "round complete");
    }
    Ok(report)
}

pub async fn run(config: Config, args: &RaceArgs) -> anyhow::Result<()> {
    let report = race(&config, args).await?;
    tracing::info!(
        op = %report.op,
        stored = report.stored,
        confirmed = report.confirmed,
        lost_after_store = report.lost_after_store,
        lost_after_confirm = report.lost_after_confirm,
        "race finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(op: &str) -> RaceArgs {
        RaceArgs {
            workers: 4,
            lag_ms: 200,
            confirm_ms: 1000,
            rounds: 2,
            op: op.to_string(),
        }
    }

    #[test]
    fn op_table_lookup() {
        assert!(find_op("claim").is_some());
        assert!(find_op("tag").is_some());
        assert!(find_op("release").is_some());
        assert!(find_op("steal").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lagged_claims_are_caught_by_confirmation() {
        let report = race(&Config::new(), &args("claim")).await.unwrap();
        // Every worker read the free record before any write propagated
        assert_eq!(report.stored, 8);
        assert_eq!(report.lost_after_store, 6);
        // Confirmation waits out the lag, so exactly one claimant per round
        assert_eq!(report.confirmed, 2);
        assert_eq!(report.lost_after_confirm, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirming_before_propagation_sees_nothing() {
        let mut a = args("claim");
        a.confirm_ms = 0;
        let report = race(&Config::new(), &a).await.unwrap();
        assert_eq!(report.stored, 8);
        assert_eq!(report.confirmed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lagged_tag_edits_are_lost() {
        let report = race(&Config::new(), &args("tag")).await.unwrap();
        assert_eq!(report.stored, 8);
        assert!(report.lost_after_store > 0);
        assert_eq!(report.lost_after_confirm, 0);
    }

    #[tokio::test]
    async fn unknown_op_is_rejected() {
        assert!(race(&Config::new(), &args("steal")).await.is_err());
    }
}
