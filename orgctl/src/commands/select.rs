//! Account selection against a saved session

use anyhow::Context;
use async_trait::async_trait;
use orgctl_lib::{
    Account, AccountSpec, AssumeRole, CallerIdentity, Config, Creds, OrgError, Provider, Registry, SessionFile, Sts,
};
use std::path::Path;
use std::sync::Arc;

/// Token service for sessions restored without network access.
struct Offline;

#[async_trait]
impl Sts for Offline {
    async fn get_caller_identity(&self, _creds: &Creds) -> orgctl_lib::Result<CallerIdentity> {
        Err(OrgError::no_access("offline session"))
    }

    async fn assume_role(&self, _creds: &Creds, _req: &AssumeRole) -> orgctl_lib::Result<Creds> {
        Err(OrgError::no_access("offline session"))
    }
}

pub async fn run(config: Config, spec: &str, session: &Path, user: Option<&str>) -> anyhow::Result<()> {
    let state = SessionFile::new(session)
        .load()
        .await
        .with_context(|| format!("failed to read session {}", session.display()))?
        .with_context(|| format!("no session at {}", session.display()))?;

    let base = Arc::new(Provider::new(|| async {
        Err::<Creds, _>(OrgError::no_access("offline session"))
    }));
    let proxy = state.proxy(Arc::new(Offline), base, config.clone());
    let registry = Registry::new(Arc::new(proxy), config);
    state.restore(&registry);

    let me = user.unwrap_or(&state.session_name);
    let spec = AccountSpec::parse(spec, me)?;
    for acct in spec.filter(&registry.all())? {
        println!("{}", line(&acct));
    }
    Ok(())
}

/// `id name owner` output line.
fn line(acct: &Account) -> String {
    let s = acct.state();
    let owner = match (&s.err, &s.ctl) {
        (Some(_), _) => "(error)",
        (None, Some(ctl)) => ctl.owner().unwrap_or("-"),
        (None, None) => "(unmanaged)",
    };
    format!("{} {} {}", acct.id(), s.name, owner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgctl_lib::memory::MemoryCloud;
    use orgctl_lib::{ControlStore, Ctl, DirectoryEntry, Proxy, SessionState};

    #[tokio::test]
    async fn selects_from_saved_session() {
        let cloud = Arc::new(MemoryCloud::new());
        let config = Config::new();
        let base = Arc::new(Provider::fixed(cloud.base_creds()));
        let proxy = Proxy::new(cloud.clone(), base, config.clone()).await.unwrap();
        let registry = Registry::new(Arc::new(proxy), config.clone());
        let entries: Vec<DirectoryEntry> = ["111111111111", "222222222222"]
            .iter()
            .map(|id| DirectoryEntry {
                id: id.parse().unwrap(),
                name: format!("n{}", &id[..1]),
            })
            .collect();
        registry.update_directory(&entries);
        let store = ControlStore::new(cloud.clone(), config.clone());
        let a = registry.all();
        store.init(&a[0], &Ctl::new().with_owner("admin")).await.unwrap();
        assert_eq!(line(&a[0]), "111111111111 n1 admin");
        assert_eq!(line(&a[1]), "222222222222 n2 (unmanaged)");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        SessionFile::new(&path)
            .save(&SessionState::capture(&registry, None))
            .await
            .unwrap();

        run(config.clone(), "owner=me", &path, None).await.unwrap();
        assert!(run(config.clone(), "333333333333", &path, None).await.is_err());
        assert!(run(config, "", &dir.path().join("missing.json"), None).await.is_err());
    }
}
