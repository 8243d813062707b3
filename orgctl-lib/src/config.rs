//! Runtime configuration
//!
//! Defaults cover a typical organization. `Config::from_env` overlays
//! `ORGCTL_*` environment variables; the CLI applies its flags on top.

use crate::{OrgError, Result};
use std::time::Duration;

/// Default number of accounts processed concurrently by bulk operations.
pub const DEFAULT_CONCURRENCY: usize = 32;

/// Default role assumed in member accounts.
pub const DEFAULT_ACCOUNT_ROLE: &str = "OrganizationAccountAccessRole";

/// orgctl configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Worker pool size for bulk operations (default: 32)
    pub concurrency: usize,
    /// Temporary credentials are treated as expired this long before their
    /// actual expiry (default: 1 minute)
    pub expiry_margin: Duration,
    /// Explicit session duration for assumed roles (default: service default)
    pub session_duration: Option<Duration>,
    /// Role name assumed in every member account
    pub account_role: String,
    /// IAM path of the control role (default: "/orgctl/")
    pub ctl_path: String,
    /// Name of the control role (default: "OrgCtl")
    pub ctl_name: String,
    /// Delay before re-reading a claimed account to confirm ownership
    /// (default: 10 seconds)
    pub confirm_delay: Duration,
    /// Upper bound for waiting on new identities or credentials to propagate
    pub propagation_timeout: Duration,
    /// Poll interval used while waiting for propagation
    pub poll_interval: Duration,
    /// Namespace mixed into the organization external ID
    pub namespace: String,
    /// Credentials persisted in a session must stay valid at least this long
    pub session_margin: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            expiry_margin: Duration::from_secs(60),
            session_duration: None,
            account_role: DEFAULT_ACCOUNT_ROLE.to_string(),
            ctl_path: "/orgctl/".to_string(),
            ctl_name: "OrgCtl".to_string(),
            confirm_delay: Duration::from_secs(10),
            propagation_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            namespace: "orgctl".to_string(),
            session_margin: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `ORGCTL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|k| std::env::var(k).ok())
    }

    /// Apply overrides from a variable lookup function.
    pub fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = var("ORGCTL_CONCURRENCY") {
            self.concurrency = parse_num("ORGCTL_CONCURRENCY", &v)? as usize;
        }
        if let Some(v) = var("ORGCTL_CONFIRM_DELAY_SECS") {
            self.confirm_delay = Duration::from_secs(parse_num("ORGCTL_CONFIRM_DELAY_SECS", &v)?);
        }
        if let Some(v) = var("ORGCTL_EXPIRY_MARGIN_SECS") {
            self.expiry_margin = Duration::from_secs(parse_num("ORGCTL_EXPIRY_MARGIN_SECS", &v)?);
        }
        if let Some(v) = var("ORGCTL_ACCOUNT_ROLE") {
            self.account_role = v;
        }
        if let Some(v) = var("ORGCTL_NAMESPACE") {
            self.namespace = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings that would make bulk operations or role paths unusable.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(OrgError::config("concurrency must be at least 1"));
        }
        if !self.ctl_path.starts_with('/') || !self.ctl_path.ends_with('/') {
            return Err(OrgError::config(format!(
                "control role path must start and end with '/': {}",
                self.ctl_path
            )));
        }
        if self.account_role.is_empty() || self.ctl_name.is_empty() {
            return Err(OrgError::config("role names must not be empty"));
        }
        Ok(())
    }

    /// Set worker pool size
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Set ownership confirmation delay
    pub fn with_confirm_delay(mut self, d: Duration) -> Self {
        self.confirm_delay = d;
        self
    }

    /// Set credential expiry margin
    pub fn with_expiry_margin(mut self, d: Duration) -> Self {
        self.expiry_margin = d;
        self
    }

    /// Set explicit assumed-role session duration
    pub fn with_session_duration(mut self, d: Duration) -> Self {
        self.session_duration = Some(d);
        self
    }

    /// Set member account role name
    pub fn with_account_role(mut self, role: impl Into<String>) -> Self {
        self.account_role = role.into();
        self
    }

    /// Set propagation wait bounds
    pub fn with_propagation(mut self, timeout: Duration, interval: Duration) -> Self {
        self.propagation_timeout = timeout;
        self.poll_interval = interval;
        self
    }
}

fn parse_num(name: &str, v: &str) -> Result<u64> {
    v.trim()
        .parse()
        .map_err(|_| OrgError::config(format!("{name} must be a non-negative integer, got {v:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let c = Config::new();
        assert_eq!(c.concurrency, 32);
        assert_eq!(c.confirm_delay, Duration::from_secs(10));
        assert_eq!(c.account_role, "OrganizationAccountAccessRole");
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ORGCTL_CONCURRENCY", "4"),
            ("ORGCTL_CONFIRM_DELAY_SECS", "25"),
            ("ORGCTL_NAMESPACE", "acme"),
        ]
        .into_iter()
        .collect();
        let c = Config::new()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(c.concurrency, 4);
        assert_eq!(c.confirm_delay, Duration::from_secs(25));
        assert_eq!(c.namespace, "acme");
        assert_eq!(c.expiry_margin, Duration::from_secs(60));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let err = Config::new()
            .with_env_overrides(|k| (k == "ORGCTL_CONCURRENCY").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("ORGCTL_CONCURRENCY"));

        let err = Config::new()
            .with_env_overrides(|k| (k == "ORGCTL_CONCURRENCY").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, OrgError::Config(_)));
    }

    #[test]
    fn test_builder() {
        let c = Config::new()
            .with_concurrency(2)
            .with_confirm_delay(Duration::from_secs(3))
            .with_session_duration(Duration::from_secs(900));
        assert_eq!(c.concurrency, 2);
        assert_eq!(c.session_duration, Some(Duration::from_secs(900)));
    }
}
