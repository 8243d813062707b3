//! Remote service seams
//!
//! orgctl talks to two remote APIs: the security token service (identity
//! lookup, role assumption) and IAM (the control role CRUD). Both are async
//! traits so that the control plane can run against a real SDK client, a
//! recorded fixture, or the in-process [`crate::memory::MemoryCloud`].
//!
//! Implementations must map HTTP 403 / access-denied codes to
//! [`crate::OrgError::NoAccess`] and keep service error codes in
//! [`crate::OrgError::Api`] so throttling can be detected.

use crate::account::AccountId;
use crate::arn::Arn;
use crate::creds::Creds;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identity behind a set of credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: Arn,
    /// Unique ID, e.g. "AIDA..." for users or "AROA...:session" for roles
    pub user_id: String,
}

/// Parameters for a role assumption call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRole {
    pub role_arn: Arn,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration: Option<Duration>,
}

/// Security token service.
#[async_trait]
pub trait Sts: Send + Sync {
    /// Who the given credentials belong to.
    async fn get_caller_identity(&self, creds: &Creds) -> Result<CallerIdentity>;

    /// Exchange `creds` for temporary credentials of `req.role_arn`.
    async fn assume_role(&self, creds: &Creds, req: &AssumeRole) -> Result<Creds>;
}

/// IAM role as seen by orgctl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub arn: Arn,
    pub path: String,
    pub name: String,
    pub description: String,
}

/// Role creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRole {
    pub path: String,
    pub name: String,
    pub assume_role_policy: String,
    pub description: String,
}

/// Identity and access management, scoped per call to one account.
#[async_trait]
pub trait Iam: Send + Sync {
    /// Create a role. Fails with an `EntityAlreadyExists` code if present.
    async fn create_role(&self, account: &AccountId, creds: &Creds, role: &NewRole) -> Result<Role>;

    /// Fetch a role, `None` if it does not exist.
    async fn get_role(&self, account: &AccountId, creds: &Creds, name: &str) -> Result<Option<Role>>;

    /// Replace a role's description, returning the role as stored.
    async fn update_role_description(
        &self,
        account: &AccountId,
        creds: &Creds,
        name: &str,
        description: &str,
    ) -> Result<Role>;

    /// Delete a role. Fails with a `NoSuchEntity` code if absent.
    async fn delete_role(&self, account: &AccountId, creds: &Creds, name: &str) -> Result<()>;
}

/// Error code returned when creating an entity that already exists.
pub const ENTITY_EXISTS: &str = "EntityAlreadyExists";

/// Error code returned when the target entity does not exist.
pub const NO_SUCH_ENTITY: &str = "NoSuchEntity";
