/// orgctl - Shared Library
///
/// Control plane for a multi-account organization: credential derivation from
/// one base identity, optimistic account ownership stored inside each
/// account, and the account spec language used to select accounts.
/// Used by the `orgctl` CLI.
pub mod account;
pub mod arn;
pub mod bulk;
pub mod clock;
pub mod cloud;
pub mod config;
pub mod control;
pub mod creds;
pub mod ctl;
pub mod error;
pub mod memory;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod spec;

pub use account::{Account, AccountId, AccountState, DirectoryEntry, Registry, Status};
pub use arn::Arn;
pub use bulk::{BatchReport, Outcome};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use cloud::{AssumeRole, CallerIdentity, Iam, NewRole, Role, Sts};
pub use config::Config;
pub use control::ControlStore;
pub use creds::{Creds, Provider, Renew, Snapshot, Validity};
pub use ctl::Ctl;
pub use error::{OrgError, Result, SpecError};
pub use memory::MemoryCloud;
pub use proxy::{OrgInfo, Proxy};
pub use session::{SessionFile, SessionState};
pub use spec::AccountSpec;
