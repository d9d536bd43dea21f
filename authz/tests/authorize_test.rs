mod common;

use authz::AuthorizedReposArgs;
use authz_core::{BindAccounts, BindMode, PermType, Perms, Repo, RepoId, UserId};
use common::harness;
use std::collections::BTreeSet;
use storage::PermsStore;

const ALICE: UserId = UserId::new(1);

#[tokio::test]
async fn test_authorized_repos_keeps_input_order() {
    let h = harness(BindMode::Username);
    h.identities.create_user(ALICE, "alice");
    for repo in [3, 1, 2] {
        h.pending_repos(&BindAccounts::internal(["alice"]), repo).await;
    }
    h.grant(ALICE).await;

    let allowed = h.authorized(ALICE, &[5, 3, 4, 1]).await;
    assert_eq!(allowed, vec![RepoId::new(3), RepoId::new(1)]);

    let none = h.authorized(ALICE, &[7, 8]).await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_cold_user_sees_nothing() {
    let h = harness(BindMode::Email);
    h.identities.create_user(ALICE, "alice");
    assert!(h.authorized(ALICE, &[1, 2, 3]).await.is_empty());

    // Unknown users are not an error for access checks
    assert!(h.authorized(UserId::new(404), &[1]).await.is_empty());
}

#[tokio::test]
async fn test_authorized_repos_accepts_repo_records() {
    let h = harness(BindMode::Username);
    h.store
        .set_repo_permissions(RepoId::new(2), Perms::Read, BTreeSet::from([ALICE]))
        .await
        .unwrap();

    let repos = vec![
        Repo::new(1, "github.com/acme/one"),
        Repo::new(2, "github.com/acme/two")
    ];
    let allowed = h
        .engine
        .authorized_repos(
            &AuthorizedReposArgs::new(ALICE, Perms::Read, PermType::Repos),
            repos
        )
        .await
        .unwrap();
    assert_eq!(allowed, vec![Repo::new(2, "github.com/acme/two")]);
}

#[tokio::test]
async fn test_write_permission_is_separate() {
    let h = harness(BindMode::Username);
    h.store
        .set_repo_permissions(RepoId::new(1), Perms::Read, BTreeSet::from([ALICE]))
        .await
        .unwrap();

    let write = h
        .engine
        .authorized_repos(
            &AuthorizedReposArgs::new(ALICE, Perms::Write, PermType::Repos),
            vec![RepoId::new(1)]
        )
        .await
        .unwrap();
    assert!(write.is_empty());
    assert_eq!(h.authorized(ALICE, &[1]).await, vec![RepoId::new(1)]);
}

#[tokio::test]
async fn test_repository_sync_replaces_access() {
    let h = harness(BindMode::Username);
    let bob = UserId::new(2);

    h.store
        .set_repo_permissions(RepoId::new(1), Perms::Read, BTreeSet::from([ALICE, bob]))
        .await
        .unwrap();
    assert_eq!(h.authorized(ALICE, &[1]).await, vec![RepoId::new(1)]);

    h.store
        .set_repo_permissions(RepoId::new(1), Perms::Read, BTreeSet::from([bob]))
        .await
        .unwrap();
    assert!(h.authorized(ALICE, &[1]).await.is_empty());
    assert_eq!(h.authorized(bob, &[1]).await, vec![RepoId::new(1)]);
}
