//! # Permission Store Contract
//!
//! Durable, transactional storage for effective and pending permission sets
//! and sub-repository overlays.
//!
//! Backends implement the row primitives of [`PermsTransaction`]. The
//! full-replace writes, grant helpers and cascading deletes are provided
//! methods built on those primitives so every backend keeps the mirrored
//! views (repo→users and user→repos, repo→bind ids and bind key→repos)
//! consistent the same way.
//!
//! A transaction dropped without [`PermsTransaction::commit`] rolls back.

use async_trait::async_trait;
use authz_core::{
    BindAccounts, BindKey, BindKeyGroup, ExternalAccountId, PermType, Perms, PermsDiff,
    PermsSource, RepoId, RepoPendingPermissions, RepoPermissions, SubRepoPermissions, UserId,
    UserPendingPermissions, UserPermissions
};
use chrono::Utc;
use errors::PermsResult;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[async_trait]
pub trait PermsTransaction: Send {
    async fn load_user_permissions(
        &mut self,
        user_id: UserId,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<Option<UserPermissions>>;

    async fn save_user_permissions(&mut self, perms: &UserPermissions) -> PermsResult<()>;

    /// Deletes the user's rows for every permission kind and resource type.
    async fn delete_user_permissions_rows(&mut self, user_id: UserId) -> PermsResult<usize>;

    async fn load_repo_permissions(
        &mut self,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<Option<RepoPermissions>>;

    async fn save_repo_permissions(&mut self, perms: &RepoPermissions) -> PermsResult<()>;

    /// Removes the user from every repository set containing it.
    async fn remove_user_from_repo_permissions(&mut self, user_id: UserId) -> PermsResult<usize>;

    async fn load_user_pending_permissions(
        &mut self,
        key: &BindKey,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<Option<UserPendingPermissions>>;

    /// All rows of a bind key, across permission kinds and resource types.
    async fn list_user_pending_permissions(
        &mut self,
        key: &BindKey
    ) -> PermsResult<Vec<UserPendingPermissions>>;

    async fn save_user_pending_permissions(
        &mut self,
        perms: &UserPendingPermissions
    ) -> PermsResult<()>;

    async fn delete_user_pending_permissions_row(
        &mut self,
        key: &BindKey,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<()>;

    async fn load_repo_pending_permissions(
        &mut self,
        repo_id: RepoId,
        perm: Perms,
        group: &BindKeyGroup
    ) -> PermsResult<Option<RepoPendingPermissions>>;

    async fn save_repo_pending_permissions(
        &mut self,
        perms: &RepoPendingPermissions
    ) -> PermsResult<()>;

    /// Sources of each repository in the user's set of `perm`.
    async fn load_user_repo_sources(
        &mut self,
        user_id: UserId,
        perm: Perms
    ) -> PermsResult<BTreeMap<RepoId, BTreeSet<PermsSource>>>;

    /// Sources of each user holding `repo_id` with `perm`.
    async fn load_repo_user_sources(
        &mut self,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<BTreeMap<UserId, BTreeSet<PermsSource>>>;

    async fn add_user_repo_source(
        &mut self,
        user_id: UserId,
        perm: Perms,
        repo_id: RepoId,
        source: PermsSource
    ) -> PermsResult<()>;

    async fn remove_user_repo_source(
        &mut self,
        user_id: UserId,
        perm: Perms,
        repo_id: RepoId,
        source: PermsSource
    ) -> PermsResult<()>;

    async fn delete_user_repo_sources(&mut self, user_id: UserId) -> PermsResult<usize>;

    async fn upsert_sub_repo_permissions(
        &mut self,
        user_id: UserId,
        repo_id: RepoId,
        perms: &SubRepoPermissions
    ) -> PermsResult<()>;

    async fn get_sub_repo_permissions_by_user(
        &mut self,
        user_id: UserId
    ) -> PermsResult<BTreeMap<RepoId, SubRepoPermissions>>;

    async fn delete_sub_repo_permissions(&mut self, user_id: UserId) -> PermsResult<usize>;

    async fn commit(self: Box<Self>) -> PermsResult<()>;

    /// Replaces the set of users a repository sync grants `repo_id` to.
    ///
    /// Users dropped by the sync keep the repository while another source
    /// still grants it. Members with no recorded source are treated as
    /// synced.
    async fn set_repo_permissions(
        &mut self,
        repo_id: RepoId,
        perm: Perms,
        user_ids: BTreeSet<UserId>
    ) -> PermsResult<PermsDiff> {
        let now = Utc::now();
        let existing = self.load_repo_permissions(repo_id, perm).await?;
        let found = existing.is_some();
        let mut record = existing.unwrap_or_else(|| RepoPermissions::new(repo_id, perm));

        let synced: BTreeSet<UserId> = self
            .load_repo_user_sources(repo_id, perm)
            .await?
            .into_iter()
            .filter(|(_, sources)| sources.contains(&PermsSource::RepoSync))
            .map(|(user_id, _)| user_id)
            .collect();
        let dropped: BTreeSet<UserId> = record
            .user_ids
            .union(&synced)
            .filter(|id| !user_ids.contains(*id))
            .copied()
            .collect();

        let mut added = 0;
        for user_id in &user_ids {
            let mut p = self
                .load_user_permissions(*user_id, perm, PermType::Repos)
                .await?
                .unwrap_or_else(|| UserPermissions::new(*user_id, perm, PermType::Repos));
            self.add_user_repo_source(*user_id, perm, repo_id, PermsSource::RepoSync)
                .await?;
            if p.ids.insert(repo_id) {
                p.updated_at = now;
                self.save_user_permissions(&p).await?;
            }
            if record.user_ids.insert(*user_id) {
                added += 1;
            }
        }

        let mut removed = 0;
        for user_id in &dropped {
            let existing = self
                .load_user_permissions(*user_id, perm, PermType::Repos)
                .await?;
            self.remove_user_repo_source(*user_id, perm, repo_id, PermsSource::RepoSync)
                .await?;
            let still_granted = self
                .load_user_repo_sources(*user_id, perm)
                .await?
                .get(&repo_id)
                .is_some_and(|sources| !sources.is_empty());
            if still_granted {
                continue;
            }

            if let Some(mut p) = existing {
                p.ids.remove(&repo_id);
                p.updated_at = now;
                self.save_user_permissions(&p).await?;
            }
            if record.user_ids.remove(user_id) {
                removed += 1;
            }
        }

        record.updated_at = now;
        record.synced_at = Some(now);
        self.save_repo_permissions(&record).await?;

        debug!(
            repo_id = %repo_id,
            perm = %perm,
            added,
            removed,
            "Replaced repository permissions"
        );

        Ok(PermsDiff {
            added,
            removed,
            found
        })
    }

    /// Replaces the bind ids of one provider context that may access
    /// `repo_id`, keeping each bind key's pending set in step.
    async fn set_repo_pending_permissions(
        &mut self,
        accounts: &BindAccounts,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<PermsDiff> {
        let now = Utc::now();
        let group = &accounts.group;
        let existing = self
            .load_repo_pending_permissions(repo_id, perm, group)
            .await?;
        let found = existing.is_some();
        let old = existing.map(|p| p.bind_ids).unwrap_or_default();
        let new: BTreeSet<String> = accounts.bind_ids.iter().cloned().collect();

        let added: Vec<&String> = new.difference(&old).collect();
        let removed: Vec<&String> = old.difference(&new).collect();

        for bind_id in &added {
            let key = group.key((*bind_id).clone());
            let mut p = self
                .load_user_pending_permissions(&key, perm, PermType::Repos)
                .await?
                .unwrap_or_else(|| UserPendingPermissions::new(key, perm, PermType::Repos));
            p.ids.insert(repo_id);
            p.updated_at = now;
            self.save_user_pending_permissions(&p).await?;
        }

        for bind_id in &removed {
            let key = group.key((*bind_id).clone());
            if let Some(mut p) = self
                .load_user_pending_permissions(&key, perm, PermType::Repos)
                .await?
            {
                p.ids.remove(&repo_id);
                p.updated_at = now;
                self.save_user_pending_permissions(&p).await?;
            }
        }

        let diff = PermsDiff {
            added: added.len(),
            removed: removed.len(),
            found
        };

        let mut record = RepoPendingPermissions::new(repo_id, perm, group.clone());
        record.bind_ids = new;
        record.updated_at = now;
        self.save_repo_pending_permissions(&record).await?;

        debug!(
            repo_id = %repo_id,
            perm = %perm,
            service_type = %group.service_type,
            service_id = %group.service_id,
            added = diff.added,
            removed = diff.removed,
            "Replaced repository pending permissions"
        );

        Ok(diff)
    }

    /// Replaces the repositories contributed by one linked external account,
    /// bypassing the pending path. A repository the account no longer
    /// contributes is kept while another source still grants it.
    async fn set_user_external_account_permissions(
        &mut self,
        user_id: UserId,
        account_id: ExternalAccountId,
        repo_ids: BTreeSet<RepoId>
    ) -> PermsResult<PermsDiff> {
        let now = Utc::now();
        let source = PermsSource::ExternalAccount(account_id);

        let existing = self
            .load_user_permissions(user_id, Perms::Read, PermType::Repos)
            .await?;
        let found = existing.is_some();
        let mut record = existing
            .unwrap_or_else(|| UserPermissions::new(user_id, Perms::Read, PermType::Repos));

        let sources = self.load_user_repo_sources(user_id, Perms::Read).await?;
        let old: BTreeSet<RepoId> = sources
            .iter()
            .filter(|(_, s)| s.contains(&source))
            .map(|(repo_id, _)| *repo_id)
            .collect();

        let mut added = 0;
        for repo_id in &repo_ids {
            self.add_user_repo_source(user_id, Perms::Read, *repo_id, source)
                .await?;
            if record.ids.insert(*repo_id) {
                self.add_user_to_repo_permissions(*repo_id, Perms::Read, user_id)
                    .await?;
                added += 1;
            }
        }

        let mut removed = 0;
        for repo_id in old.difference(&repo_ids) {
            self.remove_user_repo_source(user_id, Perms::Read, *repo_id, source)
                .await?;
            let still_granted = sources
                .get(repo_id)
                .is_some_and(|s| s.iter().any(|other| *other != source));
            if still_granted {
                continue;
            }

            if record.ids.remove(repo_id) {
                removed += 1;
            }
            if let Some(mut p) = self.load_repo_permissions(*repo_id, Perms::Read).await? {
                if p.user_ids.remove(&user_id) {
                    p.updated_at = now;
                    self.save_repo_permissions(&p).await?;
                }
            }
        }

        record.updated_at = now;
        record.synced_at = Some(now);
        self.save_user_permissions(&record).await?;

        debug!(
            user_id = %user_id,
            account_id = %account_id,
            added,
            removed,
            "Replaced external account permissions"
        );

        Ok(PermsDiff {
            added,
            removed,
            found
        })
    }

    /// Unions `repo_ids` into the user's set, creating it if absent, and
    /// records `source` for each of them. Returns how many repositories were
    /// new to the set.
    async fn merge_user_permissions(
        &mut self,
        user_id: UserId,
        perm: Perms,
        perm_type: PermType,
        repo_ids: &BTreeSet<RepoId>,
        source: PermsSource
    ) -> PermsResult<usize> {
        let mut record = self
            .load_user_permissions(user_id, perm, perm_type)
            .await?
            .unwrap_or_else(|| UserPermissions::new(user_id, perm, perm_type));

        for repo_id in repo_ids {
            self.add_user_repo_source(user_id, perm, *repo_id, source)
                .await?;
        }

        let before = record.ids.len();
        record.ids.extend(repo_ids.iter().copied());
        record.updated_at = Utc::now();
        self.save_user_permissions(&record).await?;

        Ok(record.ids.len() - before)
    }

    async fn add_user_to_repo_permissions(
        &mut self,
        repo_id: RepoId,
        perm: Perms,
        user_id: UserId
    ) -> PermsResult<()> {
        let mut record = self
            .load_repo_permissions(repo_id, perm)
            .await?
            .unwrap_or_else(|| RepoPermissions::new(repo_id, perm));

        if record.user_ids.insert(user_id) {
            record.updated_at = Utc::now();
            self.save_repo_permissions(&record).await?;
        }
        Ok(())
    }

    /// Deletes a bind key's pending row and withdraws its bind id from every
    /// repository it pointed at. Returns false when no row existed.
    async fn clear_user_pending_permissions(
        &mut self,
        key: &BindKey,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<bool> {
        let Some(pending) = self
            .load_user_pending_permissions(key, perm, perm_type)
            .await?
        else {
            return Ok(false);
        };

        let group = key.group();
        for repo_id in &pending.ids {
            if let Some(mut p) = self
                .load_repo_pending_permissions(*repo_id, perm, &group)
                .await?
            {
                if p.bind_ids.remove(&key.bind_id) {
                    p.updated_at = Utc::now();
                    self.save_repo_pending_permissions(&p).await?;
                }
            }
        }

        self.delete_user_pending_permissions_row(key, perm, perm_type)
            .await?;
        Ok(true)
    }

    /// Deletes every effective row of the user and the sources behind it.
    async fn delete_user_permissions(&mut self, user_id: UserId) -> PermsResult<usize> {
        let deleted = self.delete_user_permissions_rows(user_id).await?;
        self.delete_user_repo_sources(user_id).await?;
        Ok(deleted)
    }

    /// Clears the pending rows of every key, across permission kinds and
    /// resource types. Returns the number of rows deleted.
    async fn delete_pending_permissions_for_aliases(
        &mut self,
        keys: &[BindKey]
    ) -> PermsResult<usize> {
        let mut deleted = 0;
        for key in keys {
            for row in self.list_user_pending_permissions(key).await? {
                if self
                    .clear_user_pending_permissions(key, row.perm, row.perm_type)
                    .await?
                {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

/// A permission store. Every one-shot method runs in its own transaction.
#[async_trait]
pub trait PermsStore: Send + Sync {
    /// Backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    async fn transact(&self) -> PermsResult<Box<dyn PermsTransaction>>;

    async fn set_repo_permissions(
        &self,
        repo_id: RepoId,
        perm: Perms,
        user_ids: BTreeSet<UserId>
    ) -> PermsResult<PermsDiff> {
        let mut tx = self.transact().await?;
        let diff = tx.set_repo_permissions(repo_id, perm, user_ids).await?;
        tx.commit().await?;
        Ok(diff)
    }

    async fn set_repo_pending_permissions(
        &self,
        accounts: &BindAccounts,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<PermsDiff> {
        let mut tx = self.transact().await?;
        let diff = tx
            .set_repo_pending_permissions(accounts, repo_id, perm)
            .await?;
        tx.commit().await?;
        Ok(diff)
    }

    async fn set_user_external_account_permissions(
        &self,
        user_id: UserId,
        account_id: ExternalAccountId,
        repo_ids: BTreeSet<RepoId>
    ) -> PermsResult<PermsDiff> {
        let mut tx = self.transact().await?;
        let diff = tx
            .set_user_external_account_permissions(user_id, account_id, repo_ids)
            .await?;
        tx.commit().await?;
        Ok(diff)
    }

    async fn load_user_permissions(
        &self,
        user_id: UserId,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<Option<UserPermissions>> {
        let mut tx = self.transact().await?;
        let perms = tx.load_user_permissions(user_id, perm, perm_type).await?;
        tx.commit().await?;
        Ok(perms)
    }

    async fn load_repo_permissions(
        &self,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<Option<RepoPermissions>> {
        let mut tx = self.transact().await?;
        let perms = tx.load_repo_permissions(repo_id, perm).await?;
        tx.commit().await?;
        Ok(perms)
    }

    async fn load_user_pending_permissions(
        &self,
        key: &BindKey,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<Option<UserPendingPermissions>> {
        let mut tx = self.transact().await?;
        let perms = tx
            .load_user_pending_permissions(key, perm, perm_type)
            .await?;
        tx.commit().await?;
        Ok(perms)
    }

    async fn load_repo_pending_permissions(
        &self,
        repo_id: RepoId,
        perm: Perms,
        group: &BindKeyGroup
    ) -> PermsResult<Option<RepoPendingPermissions>> {
        let mut tx = self.transact().await?;
        let perms = tx
            .load_repo_pending_permissions(repo_id, perm, group)
            .await?;
        tx.commit().await?;
        Ok(perms)
    }

    async fn delete_user_permissions(&self, user_id: UserId) -> PermsResult<usize> {
        let mut tx = self.transact().await?;
        let deleted = tx.delete_user_permissions(user_id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_pending_permissions_for_aliases(&self, keys: &[BindKey]) -> PermsResult<usize> {
        let mut tx = self.transact().await?;
        let deleted = tx.delete_pending_permissions_for_aliases(keys).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn upsert_sub_repo_permissions(
        &self,
        user_id: UserId,
        repo_id: RepoId,
        perms: &SubRepoPermissions
    ) -> PermsResult<()> {
        let mut tx = self.transact().await?;
        tx.upsert_sub_repo_permissions(user_id, repo_id, perms)
            .await?;
        tx.commit().await
    }

    async fn get_sub_repo_permissions_by_user(
        &self,
        user_id: UserId
    ) -> PermsResult<BTreeMap<RepoId, SubRepoPermissions>> {
        let mut tx = self.transact().await?;
        let perms = tx.get_sub_repo_permissions_by_user(user_id).await?;
        tx.commit().await?;
        Ok(perms)
    }

    async fn delete_sub_repo_permissions(&self, user_id: UserId) -> PermsResult<usize> {
        let mut tx = self.transact().await?;
        let deleted = tx.delete_sub_repo_permissions(user_id).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}
