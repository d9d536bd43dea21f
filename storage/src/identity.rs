//! In-memory identity collaborator.
//!
//! Holds the identity facts the engine reads when resolving bind keys. Used
//! by tests and by embedders whose identity data already lives in memory.

use async_trait::async_trait;
use authz_core::{
    ExternalAccount, ExternalAccountId, ExternalAccountSpec, Identity, IdentityProvider,
    UserEmail, UserId
};
use dashmap::DashMap;
use errors::{PermsError, PermsResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug, Clone, Default)]
pub struct InMemoryIdentityStore {
    identities: Arc<DashMap<UserId, Identity>>,
    next_account_id: Arc<AtomicI32>
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, identity: Identity) {
        self.identities.insert(identity.user_id, identity);
    }

    /// Creates a user with a username and returns its identity.
    pub fn create_user(&self, user_id: UserId, username: &str) -> Identity {
        let mut identity = Identity::new(user_id);
        identity.username = Some(username.to_string());
        self.upsert(identity.clone());
        identity
    }

    pub fn add_email(&self, user_id: UserId, email: &str, verified: bool) -> PermsResult<()> {
        let mut identity = self.get_mut(user_id)?;
        match identity.emails.iter_mut().find(|e| e.email == email) {
            Some(existing) => existing.verified = verified,
            None => identity.emails.push(UserEmail {
                email: email.to_string(),
                verified
            })
        }
        Ok(())
    }

    pub fn set_email_verified(&self, user_id: UserId, email: &str, verified: bool) -> PermsResult<()> {
        let mut identity = self.get_mut(user_id)?;
        if let Some(existing) = identity.emails.iter_mut().find(|e| e.email == email) {
            existing.verified = verified;
        }
        Ok(())
    }

    pub fn set_username(&self, user_id: UserId, username: Option<&str>) -> PermsResult<()> {
        let mut identity = self.get_mut(user_id)?;
        identity.username = username.map(str::to_string);
        Ok(())
    }

    /// Links an external account to the user, returning its id.
    pub fn associate_external_account(
        &self,
        user_id: UserId,
        spec: ExternalAccountSpec
    ) -> PermsResult<ExternalAccountId> {
        let mut identity = self.get_mut(user_id)?;
        if let Some(existing) = identity.external_accounts.iter().find(|a| a.spec == spec) {
            return Ok(existing.id);
        }

        let id = ExternalAccountId::new(self.next_account_id.fetch_add(1, Ordering::SeqCst) + 1);
        identity.external_accounts.push(ExternalAccount { id, spec });
        Ok(id)
    }

    pub fn remove(&self, user_id: UserId) -> Option<Identity> {
        self.identities.remove(&user_id).map(|(_, identity)| identity)
    }

    fn get_mut(
        &self,
        user_id: UserId
    ) -> PermsResult<dashmap::mapref::one::RefMut<'_, UserId, Identity>> {
        self.identities
            .get_mut(&user_id)
            .ok_or(PermsError::UserNotFound {
                user_id: user_id.get()
            })
    }
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityStore {
    async fn identity(&self, user_id: UserId) -> PermsResult<Identity> {
        self.identities
            .get(&user_id)
            .map(|entry| entry.value().clone())
            .ok_or(PermsError::UserNotFound {
                user_id: user_id.get()
            })
    }
}
