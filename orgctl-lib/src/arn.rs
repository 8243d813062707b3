//! Amazon Resource Names
//!
//! Only the pieces orgctl needs: parsing identity ARNs returned by STS and
//! building role ARNs inside member accounts.

use crate::{OrgError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parsed `arn:partition:service:region:account:resource` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Arn {
    pub partition: String,
    pub service: String,
    pub region: String,
    pub account: String,
    pub resource: String,
}

impl Arn {
    /// IAM role ARN. `path` must start and end with '/'.
    pub fn role(partition: &str, account: &str, path: &str, name: &str) -> Self {
        Self {
            partition: partition.to_string(),
            service: "iam".to_string(),
            region: String::new(),
            account: account.to_string(),
            resource: format!("role{path}{name}"),
        }
    }

    /// Resource type: the part of the resource before the first '/' or ':'.
    pub fn resource_type(&self) -> &str {
        self.resource
            .split(['/', ':'])
            .next()
            .unwrap_or_default()
    }

    /// Last path segment of the resource (role, user, or session name).
    pub fn name(&self) -> &str {
        self.resource
            .rsplit(['/', ':'])
            .next()
            .unwrap_or_default()
    }

    /// IAM path of the resource, e.g. "/orgctl/" for `role/orgctl/OrgCtl`.
    pub fn path(&self) -> &str {
        match (self.resource.find('/'), self.resource.rfind('/')) {
            (Some(first), Some(last)) => &self.resource[first..=last],
            _ => "/",
        }
    }

    pub fn is_root(&self) -> bool {
        self.service == "iam" && self.resource == "root"
    }
}

impl FromStr for Arn {
    type Err = OrgError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(6, ':');
        let (Some("arn"), Some(partition), Some(service), Some(region), Some(account), Some(resource)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(OrgError::invalid_input(format!("invalid ARN: {s:?}")));
        };
        if partition.is_empty() || service.is_empty() || resource.is_empty() {
            return Err(OrgError::invalid_input(format!("invalid ARN: {s:?}")));
        }
        Ok(Self {
            partition: partition.to_string(),
            service: service.to_string(),
            region: region.to_string(),
            account: account.to_string(),
            resource: resource.to_string(),
        })
    }
}

impl TryFrom<String> for Arn {
    type Error = OrgError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Arn> for String {
    fn from(a: Arn) -> Self {
        a.to_string()
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arn:{}:{}:{}:{}:{}",
            self.partition, self.service, self.region, self.account, self.resource
        )
    }
}
