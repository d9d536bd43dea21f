//! Contract checks every permission store backend must pass.
//!
//! Each check takes a base id so checks can share one database without
//! seeing each other's rows.

use authz_core::{
    BindAccounts, BindKey, BindKeyGroup, ExternalAccountId, PermType, Perms, PermsSource, RepoId,
    SubRepoPermissions, UserId
};
use std::collections::BTreeSet;
use storage::PermsStore;

pub const BLOCK: i32 = 100;

fn users(base: i32, ids: &[i32]) -> BTreeSet<UserId> {
    ids.iter().map(|id| UserId::new(base + id)).collect()
}

fn repos(base: i32, ids: &[i32]) -> BTreeSet<RepoId> {
    ids.iter().map(|id| RepoId::new(base + id)).collect()
}

pub async fn check_set_repo_permissions_full_replace(store: &dyn PermsStore, base: i32) {
    let repo = RepoId::new(base + 1);

    let diff = store
        .set_repo_permissions(repo, Perms::Read, users(base, &[1, 2]))
        .await
        .unwrap();
    assert_eq!(diff.added, 2);
    assert!(!diff.found);

    let diff = store
        .set_repo_permissions(repo, Perms::Read, users(base, &[2, 3]))
        .await
        .unwrap();
    assert_eq!(diff.added, 1);
    assert_eq!(diff.removed, 1);
    assert!(diff.found);

    let repo_perms = store
        .load_repo_permissions(repo, Perms::Read)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repo_perms.user_ids, users(base, &[2, 3]));
    assert!(repo_perms.synced_at.is_some());

    // user 1 keeps an explicitly empty record, it was synced before
    let user1 = store
        .load_user_permissions(UserId::new(base + 1), Perms::Read, PermType::Repos)
        .await
        .unwrap()
        .unwrap();
    assert!(user1.ids.is_empty());

    let user3 = store
        .load_user_permissions(UserId::new(base + 3), Perms::Read, PermType::Repos)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user3.ids, repos(base, &[1]));

    let never = store
        .load_user_permissions(UserId::new(base + 4), Perms::Read, PermType::Repos)
        .await
        .unwrap();
    assert!(never.is_none());

    let write = store
        .load_user_permissions(UserId::new(base + 2), Perms::Write, PermType::Repos)
        .await
        .unwrap();
    assert!(write.is_none());
}

pub async fn check_replayed_sync_converges(store: &dyn PermsStore, base: i32) {
    let repo = RepoId::new(base + 1);

    store
        .set_repo_permissions(repo, Perms::Read, users(base, &[1]))
        .await
        .unwrap();
    store
        .set_repo_permissions(repo, Perms::Read, users(base, &[1, 2]))
        .await
        .unwrap();
    // A retried older sync lands last and wins without leaving stale members
    store
        .set_repo_permissions(repo, Perms::Read, users(base, &[1]))
        .await
        .unwrap();

    let repo_perms = store
        .load_repo_permissions(repo, Perms::Read)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repo_perms.user_ids, users(base, &[1]));

    let user2 = store
        .load_user_permissions(UserId::new(base + 2), Perms::Read, PermType::Repos)
        .await
        .unwrap()
        .unwrap();
    assert!(!user2.ids.contains(&repo));
}

pub async fn check_set_repo_pending_permissions(store: &dyn PermsStore, base: i32) {
    let repo = RepoId::new(base + 1);
    let group = BindKeyGroup::new("github", format!("https://github-{base}.example.com/"));

    store
        .set_repo_pending_permissions(
            &BindAccounts::new(group.clone(), ["alice", "bob"]),
            repo,
            Perms::Read
        )
        .await
        .unwrap();
    let diff = store
        .set_repo_pending_permissions(
            &BindAccounts::new(group.clone(), ["bob", "carol"]),
            repo,
            Perms::Read
        )
        .await
        .unwrap();
    assert_eq!(diff.added, 1);
    assert_eq!(diff.removed, 1);

    let repo_pending = store
        .load_repo_pending_permissions(repo, Perms::Read, &group)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        repo_pending.bind_ids,
        BTreeSet::from(["bob".to_string(), "carol".to_string()])
    );

    let alice = store
        .load_user_pending_permissions(&group.key("alice"), Perms::Read, PermType::Repos)
        .await
        .unwrap()
        .unwrap();
    assert!(alice.ids.is_empty());

    let carol = store
        .load_user_pending_permissions(&group.key("carol"), Perms::Read, PermType::Repos)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(carol.ids, repos(base, &[1]));

    // Same bind id under another provider context is a different principal
    let other = store
        .load_user_pending_permissions(&BindKey::internal("carol"), Perms::Read, PermType::Repos)
        .await
        .unwrap();
    assert!(other.is_none());
}

pub async fn check_external_account_permissions(store: &dyn PermsStore, base: i32) {
    let user = UserId::new(base + 1);
    let github = ExternalAccountId::new(base + 1);
    let gitlab = ExternalAccountId::new(base + 2);

    store
        .set_user_external_account_permissions(user, github, repos(base, &[1, 2]))
        .await
        .unwrap();
    store
        .set_user_external_account_permissions(user, gitlab, repos(base, &[2, 3]))
        .await
        .unwrap();

    let perms = store
        .load_user_permissions(user, Perms::Read, PermType::Repos)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(perms.ids, repos(base, &[1, 2, 3]));

    // Repo 2 is still contributed by gitlab
    let diff = store
        .set_user_external_account_permissions(user, github, BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(diff.removed, 1);

    let perms = store
        .load_user_permissions(user, Perms::Read, PermType::Repos)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(perms.ids, repos(base, &[2, 3]));

    let repo1 = store
        .load_repo_permissions(RepoId::new(base + 1), Perms::Read)
        .await
        .unwrap()
        .unwrap();
    assert!(!repo1.user_ids.contains(&user));
    let repo2 = store
        .load_repo_permissions(RepoId::new(base + 2), Perms::Read)
        .await
        .unwrap()
        .unwrap();
    assert!(repo2.user_ids.contains(&user));
}

async fn grant(store: &dyn PermsStore, user: UserId, repo_ids: BTreeSet<RepoId>) {
    let mut tx = store.transact().await.unwrap();
    tx.merge_user_permissions(user, Perms::Read, PermType::Repos, &repo_ids, PermsSource::Grant)
        .await
        .unwrap();
    for repo_id in &repo_ids {
        tx.add_user_to_repo_permissions(*repo_id, Perms::Read, user)
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();
}

async fn effective(store: &dyn PermsStore, user: UserId) -> BTreeSet<RepoId> {
    store
        .load_user_permissions(user, Perms::Read, PermType::Repos)
        .await
        .unwrap()
        .map(|p| p.ids)
        .unwrap_or_default()
}

async fn repo_users(store: &dyn PermsStore, repo: RepoId) -> BTreeSet<UserId> {
    store
        .load_repo_permissions(repo, Perms::Read)
        .await
        .unwrap()
        .map(|p| p.user_ids)
        .unwrap_or_default()
}

pub async fn check_account_sync_keeps_granted_repo(store: &dyn PermsStore, base: i32) {
    let user = UserId::new(base + 1);
    let account = ExternalAccountId::new(base + 1);
    let repo = RepoId::new(base + 5);

    grant(store, user, repos(base, &[5])).await;

    let diff = store
        .set_user_external_account_permissions(user, account, repos(base, &[5]))
        .await
        .unwrap();
    assert_eq!(diff.added, 0);
    let diff = store
        .set_user_external_account_permissions(user, account, BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(diff.removed, 0);

    assert_eq!(effective(store, user).await, repos(base, &[5]));
    assert_eq!(repo_users(store, repo).await, users(base, &[1]));
}

pub async fn check_account_sync_keeps_repo_synced_user(store: &dyn PermsStore, base: i32) {
    let alice = UserId::new(base + 1);
    let account = ExternalAccountId::new(base + 1);
    let repo = RepoId::new(base + 7);

    store
        .set_repo_permissions(repo, Perms::Read, users(base, &[1]))
        .await
        .unwrap();
    store
        .set_user_external_account_permissions(alice, account, repos(base, &[7]))
        .await
        .unwrap();
    store
        .set_user_external_account_permissions(alice, account, BTreeSet::new())
        .await
        .unwrap();

    assert_eq!(repo_users(store, repo).await, users(base, &[1]));
    assert_eq!(effective(store, alice).await, repos(base, &[7]));

    // Once the repository sync drops her too, nothing grants it any more
    let diff = store
        .set_repo_permissions(repo, Perms::Read, BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(diff.removed, 1);
    assert!(repo_users(store, repo).await.is_empty());
    assert!(effective(store, alice).await.is_empty());
}

pub async fn check_repo_sync_keeps_granted_user(store: &dyn PermsStore, base: i32) {
    let user = UserId::new(base + 1);
    let repo = RepoId::new(base + 1);

    store
        .set_repo_permissions(repo, Perms::Read, users(base, &[1, 2]))
        .await
        .unwrap();
    grant(store, user, repos(base, &[1])).await;

    let diff = store
        .set_repo_permissions(repo, Perms::Read, BTreeSet::new())
        .await
        .unwrap();
    assert_eq!(diff.removed, 1);
    assert_eq!(repo_users(store, repo).await, users(base, &[1]));
    assert_eq!(effective(store, user).await, repos(base, &[1]));
    assert!(effective(store, UserId::new(base + 2)).await.is_empty());

    // Deleting the user clears the grant source as well
    store.delete_user_permissions(user).await.unwrap();
    store
        .set_repo_permissions(repo, Perms::Read, users(base, &[1]))
        .await
        .unwrap();
    store
        .set_repo_permissions(repo, Perms::Read, BTreeSet::new())
        .await
        .unwrap();
    assert!(effective(store, user).await.is_empty());
}

/// Repository syncs of different repositories sharing a user must not lose
/// each other's writes to that user's set.
pub async fn check_concurrent_syncs_of_different_repos(store: &dyn PermsStore, base: i32) {
    let alice = UserId::new(base + 1);
    let bob = UserId::new(base + 2);
    let [r1, r2, r3, r4] = [1, 2, 3, 4].map(|id| RepoId::new(base + id));

    for _ in 0..3 {
        let (a, b, c, d) = tokio::join!(
            store.set_repo_permissions(r1, Perms::Read, users(base, &[1])),
            store.set_repo_permissions(r2, Perms::Read, users(base, &[1])),
            store.set_repo_permissions(r3, Perms::Read, users(base, &[1])),
            store.set_repo_permissions(r4, Perms::Read, users(base, &[1]))
        );
        for result in [a, b, c, d] {
            result.unwrap();
        }
        assert_eq!(effective(store, alice).await, repos(base, &[1, 2, 3, 4]));
        for repo in [r1, r2, r3, r4] {
            assert_eq!(repo_users(store, repo).await, users(base, &[1]));
        }

        let (a, b, c, d) = tokio::join!(
            store.set_repo_permissions(r1, Perms::Read, BTreeSet::new()),
            store.set_repo_permissions(r2, Perms::Read, BTreeSet::new()),
            store.set_repo_permissions(r3, Perms::Read, users(base, &[1, 2])),
            store.set_repo_permissions(r4, Perms::Read, users(base, &[1, 2]))
        );
        for result in [a, b, c, d] {
            result.unwrap();
        }
        assert_eq!(effective(store, alice).await, repos(base, &[3, 4]));
        assert_eq!(effective(store, bob).await, repos(base, &[3, 4]));
    }
}

pub async fn check_delete_user_and_pending(store: &dyn PermsStore, base: i32) {
    let user = UserId::new(base + 1);
    let repo = RepoId::new(base + 1);
    let alias = format!("user-{base}@example.com");

    store
        .set_repo_permissions(repo, Perms::Read, users(base, &[1]))
        .await
        .unwrap();
    store
        .set_repo_pending_permissions(&BindAccounts::internal([alias.clone()]), repo, Perms::Read)
        .await
        .unwrap();
    store
        .set_repo_pending_permissions(&BindAccounts::internal([alias.clone()]), repo, Perms::Write)
        .await
        .unwrap();

    assert_eq!(store.delete_user_permissions(user).await.unwrap(), 1);
    assert!(
        store
            .load_user_permissions(user, Perms::Read, PermType::Repos)
            .await
            .unwrap()
            .is_none()
    );

    let key = BindKey::internal(alias.clone());
    assert_eq!(
        store
            .delete_pending_permissions_for_aliases(std::slice::from_ref(&key))
            .await
            .unwrap(),
        2
    );
    for perm in Perms::ALL {
        assert!(
            store
                .load_user_pending_permissions(&key, perm, PermType::Repos)
                .await
                .unwrap()
                .is_none()
        );
        let repo_pending = store
            .load_repo_pending_permissions(repo, perm, &BindKeyGroup::internal())
            .await
            .unwrap()
            .unwrap();
        assert!(!repo_pending.bind_ids.contains(&alias));
    }

    // Idempotent
    assert_eq!(store.delete_user_permissions(user).await.unwrap(), 0);
    assert_eq!(
        store
            .delete_pending_permissions_for_aliases(&[key])
            .await
            .unwrap(),
        0
    );
}

pub async fn check_sub_repo_permissions(store: &dyn PermsStore, base: i32) {
    let user = UserId::new(base + 1);

    store
        .upsert_sub_repo_permissions(user, RepoId::new(base + 1), &SubRepoPermissions::new(["/**"]))
        .await
        .unwrap();
    store
        .upsert_sub_repo_permissions(
            user,
            RepoId::new(base + 1),
            &SubRepoPermissions::new(["-/secret/**", "/**"])
        )
        .await
        .unwrap();
    store
        .upsert_sub_repo_permissions(user, RepoId::new(base + 2), &SubRepoPermissions::new(["/docs/**"]))
        .await
        .unwrap();

    let by_user = store.get_sub_repo_permissions_by_user(user).await.unwrap();
    assert_eq!(by_user.len(), 2);
    assert_eq!(
        by_user[&RepoId::new(base + 1)].paths,
        vec!["-/secret/**", "/**"]
    );

    assert_eq!(store.delete_sub_repo_permissions(user).await.unwrap(), 2);
    assert!(
        store
            .get_sub_repo_permissions_by_user(user)
            .await
            .unwrap()
            .is_empty()
    );
}

pub async fn check_uncommitted_transaction_is_discarded(store: &dyn PermsStore, base: i32) {
    let repo = RepoId::new(base + 1);
    {
        let mut tx = store.transact().await.unwrap();
        tx.set_repo_permissions(repo, Perms::Read, users(base, &[1]))
            .await
            .unwrap();
    }

    assert!(
        store
            .load_repo_permissions(repo, Perms::Read)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .load_user_permissions(UserId::new(base + 1), Perms::Read, PermType::Repos)
            .await
            .unwrap()
            .is_none()
    );
}
