//! In-memory reference implementation of the permission store.
//!
//! Transactions are serialized behind one async mutex. Each transaction
//! works on a staged copy of the state which replaces the shared state on
//! commit; dropping the transaction discards it.

use crate::perms::{PermsStore, PermsTransaction};
use async_trait::async_trait;
use authz_core::{
    BindKey, BindKeyGroup, PermType, Perms, PermsSource, RepoId, RepoPendingPermissions,
    RepoPermissions, SubRepoPermissions, UserId, UserPendingPermissions, UserPermissions
};
use errors::{PermsError, PermsResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

const BACKEND: &str = "memory";

#[derive(Debug, Clone, Default)]
struct PermsState {
    user_perms: BTreeMap<(UserId, Perms, PermType), UserPermissions>,
    repo_perms: BTreeMap<(RepoId, Perms), RepoPermissions>,
    user_pending: BTreeMap<(BindKey, Perms, PermType), UserPendingPermissions>,
    repo_pending: BTreeMap<(RepoId, Perms, BindKeyGroup), RepoPendingPermissions>,
    repo_sources: BTreeMap<(UserId, Perms, RepoId), BTreeSet<PermsSource>>,
    sub_repo: BTreeMap<(UserId, RepoId), SubRepoPermissions>
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPermsStore {
    state: Arc<Mutex<PermsState>>,
    fail_commits: Arc<AtomicBool>
}

impl InMemoryPermsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent commit fail until reset, to exercise rollback
    /// paths.
    pub fn inject_commit_failure(&self, enabled: bool) {
        self.fail_commits.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl PermsStore for InMemoryPermsStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn transact(&self) -> PermsResult<Box<dyn PermsTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            staged,
            fail_commit: self.fail_commits.clone()
        }))
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<PermsState>,
    staged: PermsState,
    fail_commit: Arc<AtomicBool>
}

#[async_trait]
impl PermsTransaction for InMemoryTransaction {
    async fn load_user_permissions(
        &mut self,
        user_id: UserId,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<Option<UserPermissions>> {
        Ok(self
            .staged
            .user_perms
            .get(&(user_id, perm, perm_type))
            .cloned())
    }

    async fn save_user_permissions(&mut self, perms: &UserPermissions) -> PermsResult<()> {
        self.staged
            .user_perms
            .insert((perms.user_id, perms.perm, perms.perm_type), perms.clone());
        Ok(())
    }

    async fn delete_user_permissions_rows(&mut self, user_id: UserId) -> PermsResult<usize> {
        let before = self.staged.user_perms.len();
        self.staged
            .user_perms
            .retain(|(uid, _, _), _| *uid != user_id);
        Ok(before - self.staged.user_perms.len())
    }

    async fn load_repo_permissions(
        &mut self,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<Option<RepoPermissions>> {
        Ok(self.staged.repo_perms.get(&(repo_id, perm)).cloned())
    }

    async fn save_repo_permissions(&mut self, perms: &RepoPermissions) -> PermsResult<()> {
        self.staged
            .repo_perms
            .insert((perms.repo_id, perms.perm), perms.clone());
        Ok(())
    }

    async fn remove_user_from_repo_permissions(&mut self, user_id: UserId) -> PermsResult<usize> {
        let now = chrono::Utc::now();
        let mut touched = 0;
        for p in self.staged.repo_perms.values_mut() {
            if p.user_ids.remove(&user_id) {
                p.updated_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn load_user_pending_permissions(
        &mut self,
        key: &BindKey,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<Option<UserPendingPermissions>> {
        Ok(self
            .staged
            .user_pending
            .get(&(key.clone(), perm, perm_type))
            .cloned())
    }

    async fn list_user_pending_permissions(
        &mut self,
        key: &BindKey
    ) -> PermsResult<Vec<UserPendingPermissions>> {
        Ok(self
            .staged
            .user_pending
            .iter()
            .filter(|((k, _, _), _)| k == key)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn save_user_pending_permissions(
        &mut self,
        perms: &UserPendingPermissions
    ) -> PermsResult<()> {
        self.staged.user_pending.insert(
            (perms.key.clone(), perms.perm, perms.perm_type),
            perms.clone()
        );
        Ok(())
    }

    async fn delete_user_pending_permissions_row(
        &mut self,
        key: &BindKey,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<()> {
        self.staged
            .user_pending
            .remove(&(key.clone(), perm, perm_type));
        Ok(())
    }

    async fn load_repo_pending_permissions(
        &mut self,
        repo_id: RepoId,
        perm: Perms,
        group: &BindKeyGroup
    ) -> PermsResult<Option<RepoPendingPermissions>> {
        Ok(self
            .staged
            .repo_pending
            .get(&(repo_id, perm, group.clone()))
            .cloned())
    }

    async fn save_repo_pending_permissions(
        &mut self,
        perms: &RepoPendingPermissions
    ) -> PermsResult<()> {
        self.staged.repo_pending.insert(
            (perms.repo_id, perms.perm, perms.group.clone()),
            perms.clone()
        );
        Ok(())
    }

    async fn load_user_repo_sources(
        &mut self,
        user_id: UserId,
        perm: Perms
    ) -> PermsResult<BTreeMap<RepoId, BTreeSet<PermsSource>>> {
        Ok(self
            .staged
            .repo_sources
            .iter()
            .filter(|((uid, p, _), _)| *uid == user_id && *p == perm)
            .map(|((_, _, repo_id), sources)| (*repo_id, sources.clone()))
            .collect())
    }

    async fn load_repo_user_sources(
        &mut self,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<BTreeMap<UserId, BTreeSet<PermsSource>>> {
        Ok(self
            .staged
            .repo_sources
            .iter()
            .filter(|((_, p, rid), _)| *rid == repo_id && *p == perm)
            .map(|((user_id, _, _), sources)| (*user_id, sources.clone()))
            .collect())
    }

    async fn add_user_repo_source(
        &mut self,
        user_id: UserId,
        perm: Perms,
        repo_id: RepoId,
        source: PermsSource
    ) -> PermsResult<()> {
        self.staged
            .repo_sources
            .entry((user_id, perm, repo_id))
            .or_default()
            .insert(source);
        Ok(())
    }

    async fn remove_user_repo_source(
        &mut self,
        user_id: UserId,
        perm: Perms,
        repo_id: RepoId,
        source: PermsSource
    ) -> PermsResult<()> {
        let key = (user_id, perm, repo_id);
        if let Some(sources) = self.staged.repo_sources.get_mut(&key) {
            sources.remove(&source);
            if sources.is_empty() {
                self.staged.repo_sources.remove(&key);
            }
        }
        Ok(())
    }

    async fn delete_user_repo_sources(&mut self, user_id: UserId) -> PermsResult<usize> {
        let before = self.staged.repo_sources.len();
        self.staged
            .repo_sources
            .retain(|(uid, _, _), _| *uid != user_id);
        Ok(before - self.staged.repo_sources.len())
    }

    async fn upsert_sub_repo_permissions(
        &mut self,
        user_id: UserId,
        repo_id: RepoId,
        perms: &SubRepoPermissions
    ) -> PermsResult<()> {
        self.staged
            .sub_repo
            .insert((user_id, repo_id), perms.clone());
        Ok(())
    }

    async fn get_sub_repo_permissions_by_user(
        &mut self,
        user_id: UserId
    ) -> PermsResult<BTreeMap<RepoId, SubRepoPermissions>> {
        Ok(self
            .staged
            .sub_repo
            .iter()
            .filter(|((uid, _), _)| *uid == user_id)
            .map(|((_, repo_id), perms)| (*repo_id, perms.clone()))
            .collect())
    }

    async fn delete_sub_repo_permissions(&mut self, user_id: UserId) -> PermsResult<usize> {
        let before = self.staged.sub_repo.len();
        self.staged.sub_repo.retain(|(uid, _), _| *uid != user_id);
        Ok(before - self.staged.sub_repo.len())
    }

    async fn commit(self: Box<Self>) -> PermsResult<()> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(PermsError::transaction(BACKEND, "injected commit failure"));
        }
        let InMemoryTransaction {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}
