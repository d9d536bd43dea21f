#![allow(dead_code)]

use authz::{
    AuthorizedReposArgs, AuthzEngine, GrantOutcome, GrantPendingPermissionsArgs,
    RevokeUserPermissionsArgs
};
use authz_core::{BindAccounts, BindMode, PermType, Perms, RepoId, UserId};
use config::SharedBindPolicy;
use std::collections::BTreeSet;
use std::sync::Arc;
use storage::{InMemoryIdentityStore, InMemoryPermsStore, PermsStore};

pub struct Harness {
    pub engine: AuthzEngine,
    pub store: Arc<InMemoryPermsStore>,
    pub identities: Arc<InMemoryIdentityStore>,
    pub policy: SharedBindPolicy
}

pub fn harness(mode: BindMode) -> Harness {
    testing::init_tracing();

    let store = Arc::new(InMemoryPermsStore::new());
    let identities = Arc::new(InMemoryIdentityStore::new());
    let policy = SharedBindPolicy::new(mode);
    let engine = AuthzEngine::new(store.clone(), identities.clone(), Arc::new(policy.clone()));

    Harness {
        engine,
        store,
        identities,
        policy
    }
}

pub fn repo_ids(ids: &[i32]) -> BTreeSet<RepoId> {
    ids.iter().copied().map(RepoId::new).collect()
}

impl Harness {
    pub async fn grant(&self, user_id: UserId) -> GrantOutcome {
        self.engine
            .grant_pending_permissions(&GrantPendingPermissionsArgs::new(
                user_id,
                Perms::Read,
                PermType::Repos
            ))
            .await
            .unwrap()
    }

    pub async fn authorized(&self, user_id: UserId, candidates: &[i32]) -> Vec<RepoId> {
        self.engine
            .authorized_repos(
                &AuthorizedReposArgs::new(user_id, Perms::Read, PermType::Repos),
                candidates.iter().copied().map(RepoId::new).collect()
            )
            .await
            .unwrap()
    }

    pub async fn revoke(&self, user_id: UserId, accounts: Vec<BindAccounts>) {
        self.engine
            .revoke_user_permissions(&RevokeUserPermissionsArgs::new(user_id, accounts))
            .await
            .unwrap();
    }

    /// The user's effective read set, `None` when no record exists.
    pub async fn effective(&self, user_id: UserId) -> Option<BTreeSet<RepoId>> {
        self.store
            .load_user_permissions(user_id, Perms::Read, PermType::Repos)
            .await
            .unwrap()
            .map(|p| p.ids)
    }

    pub async fn pending_repos(&self, accounts: &BindAccounts, repo_id: i32) {
        self.store
            .set_repo_pending_permissions(accounts, RepoId::new(repo_id), Perms::Read)
            .await
            .unwrap();
    }
}
