//! Shared types and collaborator traits for the authorization engine

pub mod traits;
pub mod types;

pub use traits::{BindPolicySource, IdentityProvider};
pub use types::*;
