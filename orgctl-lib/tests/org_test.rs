//! Integration tests across the registry, bulk runner, account specs, and
//! persisted sessions.

use orgctl_lib::bulk::{self, BatchReport};
use orgctl_lib::memory::MemoryCloud;
use orgctl_lib::proxy::external_id;
use orgctl_lib::{
    AccountId, AccountSpec, Arn, CallerIdentity, Clock, Config, ControlStore, Creds, Ctl, DirectoryEntry, OrgError, OrgInfo,
    Provider, Proxy, Registry, SessionFile, SessionState, Snapshot, SpecError, Validity,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn id(n: u64) -> AccountId {
    AccountId::parse(&format!("{n:012}")).unwrap()
}

fn directory(n: u64) -> Vec<DirectoryEntry> {
    (1..=n)
        .map(|i| DirectoryEntry {
            id: id(i),
            name: format!("acct-{i}"),
        })
        .collect()
}

fn alice() -> CallerIdentity {
    CallerIdentity {
        account: "000000000000".into(),
        arn: "arn:aws:sts::000000000000:assumed-role/Admin/alice".parse::<Arn>().unwrap(),
        user_id: "AROAEXAMPLE:alice".into(),
    }
}

async fn registry(cloud: &Arc<MemoryCloud>) -> Registry {
    let config = Config::new();
    let base = Arc::new(Provider::fixed(cloud.base_creds()));
    let proxy = Proxy::new(cloud.clone(), base, config.clone()).await.unwrap();
    Registry::new(Arc::new(proxy), config)
}

#[tokio::test]
async fn test_directory_updates() {
    let cloud = Arc::new(MemoryCloud::new());
    let reg = registry(&cloud).await;

    assert_eq!(reg.update_directory(&directory(3)), 3);
    assert_eq!(reg.update_directory(&directory(2)), 0);
    assert_eq!(reg.len(), 3);
    assert!(reg.get(&id(1)).unwrap().status().in_org);
    assert!(!reg.get(&id(3)).unwrap().status().in_org);
    assert_eq!(reg.find_by_name("acct-2").unwrap().id(), &id(2));

    let role = reg.get(&id(1)).unwrap().creds().retrieve().await.unwrap();
    assert!(role.source.ends_with(":role/OrganizationAccountAccessRole"));
}

#[tokio::test]
async fn test_bulk_load_with_partial_failure() {
    let cloud = Arc::new(MemoryCloud::new());
    let reg = registry(&cloud).await;
    reg.update_directory(&directory(5));
    let store = Arc::new(ControlStore::new(cloud.clone(), reg.config().clone()));

    for i in 1..=3 {
        store.init(&reg.get(&id(i)).unwrap(), &Ctl::new()).await.unwrap();
    }
    // Forget what init cached so the bulk load does the work
    let fresh = registry(&cloud).await;
    fresh.update_directory(&directory(5));
    cloud.deny(&id(5));

    let out = bulk::load_ctl(&store, &fresh.all(), 2).await;
    assert_eq!(out.len(), 5);
    let report = BatchReport::new(&out);
    assert_eq!(report.ok, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(report.by_kind.get("no_ctl"), Some(&1));
    assert_eq!(report.by_kind.get("no_access"), Some(&1));

    let acct4 = fresh.get(&id(4)).unwrap();
    assert!(!acct4.is_managed() && !acct4.has_error());
    assert!(fresh.get(&id(5)).unwrap().has_error());
}

#[tokio::test]
async fn test_aliases_and_deregister() {
    let cloud = Arc::new(MemoryCloud::new());
    let reg = registry(&cloud).await;
    reg.update_directory(&directory(2));

    let aliases = BTreeMap::from([(id(1), "prod".to_string()), (id(9), "sandbox".to_string())]);
    reg.apply_aliases(&aliases);
    assert_eq!(reg.len(), 3);
    assert_eq!(reg.get(&id(1)).unwrap().name(), "prod");
    assert!(reg.find_by_name("acct-1").is_none());
    let sandbox = reg.find_by_name("sandbox").unwrap();
    assert_eq!(sandbox.id(), &id(9));
    assert!(!sandbox.status().in_org);

    assert_eq!(reg.deregister(&id(9)).unwrap().id(), &id(9));
    assert!(reg.get(&id(9)).is_none());
    assert!(reg.deregister(&id(9)).is_none());
    assert_eq!(reg.len(), 2);
}

#[tokio::test]
async fn test_recovered_account_is_selectable() {
    let cloud = Arc::new(MemoryCloud::new());
    let reg = registry(&cloud).await;
    reg.update_directory(&directory(1));
    let store = ControlStore::new(cloud.clone(), reg.config().clone());
    let acct = reg.get(&id(1)).unwrap();
    store.init(&acct, &Ctl::new().with_tags(["x"]).unwrap()).await.unwrap();

    let select = || {
        let spec = AccountSpec::parse("x", "admin").unwrap();
        spec.filter(&reg.all()).unwrap().len()
    };
    cloud.deny(&id(1));
    let out = bulk::ensure_creds(&reg.all(), Validity::Renew, 1).await;
    assert!(out[0].1.is_err());
    assert!(acct.has_error());
    assert_eq!(select(), 0);

    cloud.allow(&id(1));
    let out = bulk::ensure_creds(&reg.all(), Validity::Renew, 1).await;
    assert!(out[0].1.is_ok());
    assert!(acct.status().creds_valid);
    assert!(!acct.has_error());
    assert_eq!(select(), 1);
}

#[tokio::test]
async fn test_spec_over_loaded_accounts() {
    let cloud = Arc::new(MemoryCloud::new().with_identity(alice()));
    let reg = registry(&cloud).await;
    assert_eq!(reg.proxy().session_name(), "alice");
    reg.update_directory(&directory(4));
    let store = Arc::new(ControlStore::new(cloud.clone(), reg.config().clone()));

    let ctls = [
        Ctl::new().with_owner("alice").with_tags(["tag1"]).unwrap(),
        Ctl::new().with_owner("bob").with_tags(["tag1"]).unwrap(),
        Ctl::new().with_tags(["tag1", "tag2"]).unwrap(),
    ];
    for (i, c) in ctls.iter().enumerate() {
        store.init(&reg.get(&id(i as u64 + 1)).unwrap(), c).await.unwrap();
    }
    cloud.deny(&id(4));
    bulk::load_ctl(&store, &reg.all(), 4).await;

    let select = |s: &str| -> Result<Vec<AccountId>, SpecError> {
        let spec = AccountSpec::parse(s, reg.proxy().session_name())?;
        Ok(spec.filter(&reg.all())?.iter().map(|a| a.id().clone()).collect())
    };
    assert_eq!(select("owner=me,tag1").unwrap(), [id(1)]);
    assert_eq!(select("tag1,!tag2").unwrap(), [id(1), id(2)]);
    assert_eq!(select("!owner").unwrap(), [id(3)]);
    assert_eq!(select("!owner,err").unwrap(), [id(3), id(4)]);
    assert_eq!(select("acct-1,acct-4").unwrap(), [id(1), id(4)]);
    assert_eq!(select("acct-1,!acct-2"), Err(SpecError::IllegalNegation("acct-2".into())));
    assert_eq!(select("000000000009"), Err(SpecError::UnknownId("000000000009".into())));
}

#[tokio::test]
async fn test_external_id_gates_assumption() {
    let cloud = Arc::new(MemoryCloud::new());
    let org = OrgInfo {
        id: "o-abc123".into(),
        master_account_id: "000000000000".into(),
        master_account_email: "root@example.com".into(),
    };
    cloud.require_external_id(Some(external_id(&org, "orgctl")));

    let reg = registry(&cloud).await;
    let early = reg.register(id(1), "a");
    assert!(early.creds().retrieve().await.unwrap_err().is_no_access());

    reg.proxy().set_org(&org);
    let late = reg.register(id(2), "b");
    late.creds().retrieve().await.unwrap();
    // Providers created before the org was known pick up the external ID too
    early.creds().ensure(Validity::Renew).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wait_usable_polls_new_accounts() {
    let cloud = Arc::new(MemoryCloud::new());
    let reg = registry(&cloud).await;
    let acct = reg.register(id(7), "new");
    cloud.deny(&id(7));

    let waiter = {
        let proxy = reg.proxy().clone();
        let provider = acct.creds().clone();
        tokio::spawn(async move { proxy.wait_usable(&provider, Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cloud.allow(&id(7));
    // The proxy polls every 2 seconds by default
    let creds = tokio::time::timeout(Duration::from_secs(10), waiter).await.unwrap().unwrap().unwrap();
    assert!(creds.can_expire);
}

#[tokio::test]
async fn test_session_round_trip() {
    let cloud = Arc::new(MemoryCloud::new());
    let org = OrgInfo {
        id: "o-abc123".into(),
        master_account_id: "000000000000".into(),
        master_account_email: "root@example.com".into(),
    };
    let reg = registry(&cloud).await;
    reg.update_directory(&directory(3));
    let store = Arc::new(ControlStore::new(cloud.clone(), reg.config().clone()));
    store
        .init(&reg.get(&id(1)).unwrap(), &Ctl::new().with_owner("alice"))
        .await
        .unwrap();
    cloud.deny(&id(3));
    bulk::ensure_creds(&reg.all(), Validity::For(Duration::from_secs(600)), 4).await;

    // Unstored local edits are not persisted
    reg.get(&id(1)).unwrap().edit_ctl(|c| c.desc = "draft".into()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = SessionFile::new(dir.path().join("session.json"));
    assert!(file.load().await.unwrap().is_none());
    file.save(&SessionState::capture(&reg, Some(&org))).await.unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    let state = file.load().await.unwrap().unwrap();
    assert_eq!(state.session_name, "admin");
    assert_eq!(state.accounts.len(), 3);
    assert_eq!(state.creds.len(), 3);
    assert!(state.creds.iter().any(|c| c.error.is_some()));

    let calls = cloud.calls();
    let base = Arc::new(Provider::fixed(cloud.base_creds()));
    let proxy = state.proxy(cloud.clone(), base, Config::new());
    assert_eq!(proxy.external_id(), Some(external_id(&org, "orgctl")));
    let restored = Registry::new(Arc::new(proxy), Config::new());
    state.restore(&restored);

    let a1 = restored.get(&id(1)).unwrap();
    assert_eq!(a1.name(), "acct-1");
    assert_eq!(a1.ctl().unwrap().desc, "");
    assert_eq!(a1.ctl(), a1.reference());
    a1.creds().retrieve().await.unwrap();
    let a3 = restored.get(&id(3)).unwrap();
    assert!(matches!(a3.creds().retrieve().await, Err(OrgError::Cached(_))));
    assert!(a3.has_error());
    // Everything came from the session
    assert_eq!(cloud.calls(), calls);

    file.clear().await.unwrap();
    file.clear().await.unwrap();
    assert!(file.load().await.unwrap().is_none());
}

#[tokio::test]
async fn test_capture_skips_short_creds_and_expired_errors() {
    let cloud = Arc::new(MemoryCloud::new());
    let reg = registry(&cloud).await;
    reg.update_directory(&directory(4));
    let now = reg.proxy().clock().now();
    let minutes = |m: i64| chrono::Duration::minutes(m);

    // Inside the five minute session margin
    reg.get(&id(1))
        .unwrap()
        .creds()
        .store(Ok(Creds::temporary("AKIASHORT", "s", "t", now + minutes(4))));
    // Backoff already over
    reg.get(&id(2)).unwrap().creds().restore(Snapshot {
        creds: Creds {
            can_expire: true,
            expires: Some(now - minutes(1)),
            ..Creds::default()
        },
        err: Some(OrgError::no_access("denied")),
    });
    reg.get(&id(3))
        .unwrap()
        .creds()
        .store(Ok(Creds::temporary("AKIALONG", "s", "t", now + minutes(60))));
    reg.get(&id(4)).unwrap().creds().restore(Snapshot {
        creds: Creds {
            can_expire: true,
            expires: Some(now + minutes(30)),
            ..Creds::default()
        },
        err: Some(OrgError::no_access("denied")),
    });

    let state = SessionState::capture(&reg, None);
    let kept: Vec<&AccountId> = state.creds.iter().map(|c| &c.account_id).collect();
    assert_eq!(kept, [&id(3), &id(4)]);
    assert_eq!(state.creds[0].creds.access_key_id, "AKIALONG");
    assert_eq!(state.creds[1].error.as_deref(), Some("no access: denied"));
    assert_eq!(state.accounts.len(), 4);
}
