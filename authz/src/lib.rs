//! # Authorization Engine
//!
//! Binds permissions synced from code hosts to users.
//!
//! - Pending permissions addressed to bind keys (emails, usernames, external
//!   accounts) are granted to a user under the active binding mode
//! - Repository access checks filter candidates by the user's effective set
//! - Revocation removes every permission trace of a user in one transaction
//! - Sub-repository rules narrow a repository grant to some of its paths

pub mod engine;
pub mod resolver;
pub mod setup;
pub mod sub_repo;
pub mod telemetry;

pub use engine::{
    AuthorizedReposArgs, AuthzEngine, GrantOutcome, GrantPendingPermissionsArgs,
    RevokeUserPermissionsArgs
};
pub use errors::{PermsError, PermsResult};
pub use resolver::resolve_bind_keys;
pub use setup::open_store;
pub use sub_repo::SubRepoRules;
