//! Path-level restrictions on top of repository access.

mod common;

use authz::PermsError;
use authz_core::{BindMode, Perms, RepoId, SubRepoPermissions, UserId};
use common::harness;
use std::collections::BTreeSet;
use storage::PermsStore;

const ALICE: UserId = UserId::new(1);
const REPO: RepoId = RepoId::new(1);

async fn granted_harness() -> common::Harness {
    let h = harness(BindMode::Username);
    h.store
        .set_repo_permissions(REPO, Perms::Read, BTreeSet::from([ALICE]))
        .await
        .unwrap();
    h
}

#[tokio::test]
async fn test_unrestricted_repository_allows_every_path() {
    let h = granted_harness().await;
    let paths = vec!["/README.md", "/src/main.rs", "docs/guide.md"];
    let allowed = h
        .engine
        .filter_paths(ALICE, Perms::Read, REPO, paths.clone())
        .await
        .unwrap();
    assert_eq!(allowed, paths);
}

#[tokio::test]
async fn test_rules_filter_paths_in_order() {
    let h = granted_harness().await;
    h.engine
        .upsert_sub_repo_permissions(
            ALICE,
            REPO,
            &SubRepoPermissions::new(["-/src/secret/**", "/src/**", "/README.md"])
        )
        .await
        .unwrap();

    let allowed = h
        .engine
        .filter_paths(
            ALICE,
            Perms::Read,
            REPO,
            vec![
                "/src/lib.rs".to_string(),
                "/src/secret/key.pem".to_string(),
                "README.md".to_string(),
                "/docs/guide.md".to_string()
            ]
        )
        .await
        .unwrap();
    assert_eq!(allowed, vec!["/src/lib.rs", "README.md"]);

    assert!(
        h.engine
            .can_read_path(ALICE, Perms::Read, REPO, "/src/nested/mod.rs")
            .await
            .unwrap()
    );
    assert!(
        !h.engine
            .can_read_path(ALICE, Perms::Read, REPO, "/src/secret/key.pem")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_paths_denied_without_repository_access() {
    let h = harness(BindMode::Username);
    h.engine
        .upsert_sub_repo_permissions(ALICE, REPO, &SubRepoPermissions::new(["**"]))
        .await
        .unwrap();

    assert!(
        !h.engine
            .can_read_path(ALICE, Perms::Read, REPO, "/README.md")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_empty_rule_list_denies() {
    let h = granted_harness().await;
    h.engine
        .upsert_sub_repo_permissions(ALICE, REPO, &SubRepoPermissions::default())
        .await
        .unwrap();

    let allowed = h
        .engine
        .filter_paths(ALICE, Perms::Read, REPO, vec!["/README.md"])
        .await
        .unwrap();
    assert!(allowed.is_empty());
}

#[tokio::test]
async fn test_upsert_replaces_rules() {
    let h = granted_harness().await;
    h.engine
        .upsert_sub_repo_permissions(ALICE, REPO, &SubRepoPermissions::new(["/a/**"]))
        .await
        .unwrap();
    h.engine
        .upsert_sub_repo_permissions(ALICE, REPO, &SubRepoPermissions::new(["/b/**"]))
        .await
        .unwrap();

    let rules = h.engine.get_sub_repo_permissions_by_user(ALICE).await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[&REPO].paths, vec!["/b/**"]);
    assert!(
        !h.engine
            .can_read_path(ALICE, Perms::Read, REPO, "/a/file")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_invalid_rules_are_not_stored() {
    let h = granted_harness().await;
    let err = h
        .engine
        .upsert_sub_repo_permissions(ALICE, REPO, &SubRepoPermissions::new(["/ok/**", "/bad/["]))
        .await
        .unwrap_err();
    assert!(matches!(err, PermsError::InvalidPattern { ref pattern, .. } if pattern == "/bad/["));

    let rules = h.engine.get_sub_repo_permissions_by_user(ALICE).await.unwrap();
    assert!(rules.is_empty());
}

#[tokio::test]
async fn test_rules_are_per_repository() {
    let h = granted_harness().await;
    let other = RepoId::new(2);
    h.store
        .set_repo_permissions(other, Perms::Read, BTreeSet::from([ALICE]))
        .await
        .unwrap();
    h.engine
        .upsert_sub_repo_permissions(ALICE, REPO, &SubRepoPermissions::new(["/docs/**"]))
        .await
        .unwrap();

    assert!(
        !h.engine
            .can_read_path(ALICE, Perms::Read, REPO, "/src/main.rs")
            .await
            .unwrap()
    );
    assert!(
        h.engine
            .can_read_path(ALICE, Perms::Read, other, "/src/main.rs")
            .await
            .unwrap()
    );
}
