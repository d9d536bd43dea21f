//! Collaborator traits consumed by the authorization engine

use crate::types::{BindMode, Identity, UserId};
use async_trait::async_trait;
use errors::PermsResult;
use std::sync::Arc;

/// Read-only access to a user's identity facts.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns `PermsError::UserNotFound` for unknown users.
    async fn identity(&self, user_id: UserId) -> PermsResult<Identity>;
}

#[async_trait]
impl<T: IdentityProvider + ?Sized> IdentityProvider for Arc<T> {
    async fn identity(&self, user_id: UserId) -> PermsResult<Identity> {
        (**self).identity(user_id).await
    }
}

/// Source of the active binding mode. Implementations are read on every
/// call and must not be cached by callers.
pub trait BindPolicySource: Send + Sync {
    fn bind_mode(&self) -> BindMode;
}

impl BindPolicySource for BindMode {
    fn bind_mode(&self) -> BindMode {
        *self
    }
}

impl<T: BindPolicySource + ?Sized> BindPolicySource for Arc<T> {
    fn bind_mode(&self) -> BindMode {
        (**self).bind_mode()
    }
}
