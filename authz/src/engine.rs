use crate::resolver::resolve_bind_keys;
use crate::telemetry::{OperationTimer, Telemetry};
use authz_core::{
    BindAccounts, BindKey, BindMode, BindPolicySource, HasRepoId, Identity, IdentityProvider,
    PermType, Perms, PermsSource, RepoId, UserId
};
use errors::{PermsError, PermsResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::PermsStore;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantPendingPermissionsArgs {
    pub user_id: UserId,
    pub perm: Perms,
    pub perm_type: PermType
}

impl GrantPendingPermissionsArgs {
    pub fn new(user_id: UserId, perm: Perms, perm_type: PermType) -> Self {
        Self {
            user_id,
            perm,
            perm_type
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizedReposArgs {
    pub user_id: UserId,
    pub perm: Perms,
    pub perm_type: PermType
}

impl AuthorizedReposArgs {
    pub fn new(user_id: UserId, perm: Perms, perm_type: PermType) -> Self {
        Self {
            user_id,
            perm,
            perm_type
        }
    }
}

/// Arguments of a revocation. `accounts` must be snapshotted by the caller
/// before the identity is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeUserPermissionsArgs {
    pub user_id: UserId,
    pub accounts: Vec<BindAccounts>
}

impl RevokeUserPermissionsArgs {
    pub fn new(user_id: UserId, accounts: Vec<BindAccounts>) -> Self {
        Self { user_id, accounts }
    }

    /// Every alias the identity may ever have been addressed by.
    pub fn from_identity(identity: &Identity) -> Self {
        Self::new(identity.user_id, identity.revocation_aliases())
    }
}

/// What a grant did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantOutcome {
    pub mode: BindMode,
    /// Bind keys derived from the identity
    pub candidates: usize,
    /// Candidates that had pending repositories
    pub matched: usize,
    /// Repositories carried over from the matched pending sets
    pub granted: usize,
    /// Repositories that were new to the effective set
    pub added: usize
}

impl GrantOutcome {
    fn empty(mode: BindMode, candidates: usize) -> Self {
        Self {
            mode,
            candidates,
            matched: 0,
            granted: 0,
            added: 0
        }
    }
}

/// Authorization engine.
///
/// Binds pending permissions to users, answers repository access checks,
/// revokes every permission trace of a user and evaluates sub-repository
/// path rules. Every operation that writes runs in a single store
/// transaction.
pub struct AuthzEngine {
    store: Arc<dyn PermsStore>,
    identities: Arc<dyn IdentityProvider>,
    policy: Arc<dyn BindPolicySource>,
    operation_timeout: Option<Duration>,
    metrics_enabled: bool
}

impl AuthzEngine {
    pub fn new(
        store: Arc<dyn PermsStore>,
        identities: Arc<dyn IdentityProvider>,
        policy: Arc<dyn BindPolicySource>
    ) -> Self {
        Self {
            store,
            identities,
            policy,
            operation_timeout: None,
            metrics_enabled: true
        }
    }

    /// Bounds every operation, store transaction included. An operation that
    /// runs past it fails with `PermsError::DeadlineExceeded` and its
    /// transaction is rolled back.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn store(&self) -> &Arc<dyn PermsStore> {
        &self.store
    }

    pub fn bind_mode(&self) -> BindMode {
        self.policy.bind_mode()
    }

    pub(crate) fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }

    /// Moves the pending permissions addressed to the user's bind keys into
    /// the user's effective set, under the binding mode currently in effect.
    pub async fn grant_pending_permissions(
        &self,
        args: &GrantPendingPermissionsArgs
    ) -> PermsResult<GrantOutcome> {
        let mode = self.policy.bind_mode();
        self.grant_pending_permissions_with_mode(args, mode).await
    }

    /// Same as [`Self::grant_pending_permissions`] with an explicit mode.
    ///
    /// Candidates with nothing pending are left untouched. When no candidate
    /// matches, nothing is written.
    #[instrument(skip(self, args), fields(user_id = %args.user_id, perm = %args.perm, mode = %mode))]
    pub async fn grant_pending_permissions_with_mode(
        &self,
        args: &GrantPendingPermissionsArgs,
        mode: BindMode
    ) -> PermsResult<GrantOutcome> {
        self.observe("grant", async {
            let identity = self.identities.identity(args.user_id).await?;
            let candidates = resolve_bind_keys(&identity, mode);
            if candidates.is_empty() {
                debug!("No bind keys for user, nothing to grant");
                return Ok(GrantOutcome::empty(mode, 0));
            }

            let mut tx = self.store.transact().await?;

            let mut matched: Vec<&BindKey> = Vec::new();
            let mut repo_ids: BTreeSet<RepoId> = BTreeSet::new();
            for key in &candidates {
                let pending = tx
                    .load_user_pending_permissions(key, args.perm, args.perm_type)
                    .await?;
                if let Some(pending) = pending.filter(|p| !p.ids.is_empty()) {
                    debug!(bind_key = %key, repos = pending.ids.len(), "Matched pending permissions");
                    repo_ids.extend(pending.ids);
                    matched.push(key);
                }
            }

            if matched.is_empty() {
                debug!(
                    candidates = candidates.len(),
                    "No pending permissions for bind keys"
                );
                return Ok(GrantOutcome::empty(mode, candidates.len()));
            }

            let added = tx
                .merge_user_permissions(
                    args.user_id,
                    args.perm,
                    args.perm_type,
                    &repo_ids,
                    PermsSource::Grant
                )
                .await?;
            for repo_id in &repo_ids {
                tx.add_user_to_repo_permissions(*repo_id, args.perm, args.user_id)
                    .await?;
            }
            for key in &matched {
                tx.clear_user_pending_permissions(key, args.perm, args.perm_type)
                    .await?;
            }
            tx.commit().await?;

            let outcome = GrantOutcome {
                mode,
                candidates: candidates.len(),
                matched: matched.len(),
                granted: repo_ids.len(),
                added
            };

            info!(
                candidates = outcome.candidates,
                matched = outcome.matched,
                granted = outcome.granted,
                added = outcome.added,
                "Granted pending permissions"
            );
            if self.metrics_enabled {
                Telemetry::record_grant(mode.to_string().as_str(), outcome.matched, outcome.granted);
            }

            Ok(outcome)
        })
        .await
    }

    /// Returns the subset of `repos` the user may access, in input order.
    ///
    /// A user with no effective record has access to nothing. An empty input
    /// is answered without reading the store.
    #[instrument(skip(self, args, repos), fields(user_id = %args.user_id, perm = %args.perm, candidates = repos.len()))]
    pub async fn authorized_repos<T: HasRepoId>(
        &self,
        args: &AuthorizedReposArgs,
        repos: Vec<T>
    ) -> PermsResult<Vec<T>> {
        if repos.is_empty() {
            return Ok(repos);
        }

        self.observe("authorized_repos", async move {
            let candidates = repos.len();
            let Some(perms) = self
                .store
                .load_user_permissions(args.user_id, args.perm, args.perm_type)
                .await?
            else {
                debug!("No effective permissions for user");
                if self.metrics_enabled {
                    Telemetry::record_authorization(candidates, 0);
                }
                return Ok(Vec::new());
            };

            let allowed: Vec<T> = repos
                .into_iter()
                .filter(|repo| perms.ids.contains(&repo.repo_id()))
                .collect();

            debug!(allowed = allowed.len(), "Filtered repositories");
            if self.metrics_enabled {
                Telemetry::record_authorization(candidates, allowed.len());
            }
            Ok(allowed)
        })
        .await
    }

    /// Deletes every permission trace of the user: effective sets, its
    /// membership in repository sets, pending sets addressed to the given
    /// aliases, and sub-repository rules. Idempotent.
    #[instrument(skip(self, args), fields(user_id = %args.user_id, accounts = args.accounts.len()))]
    pub async fn revoke_user_permissions(&self, args: &RevokeUserPermissionsArgs) -> PermsResult<()> {
        self.observe("revoke", async {
            let keys: Vec<BindKey> = args
                .accounts
                .iter()
                .flat_map(|accounts| accounts.bind_keys())
                .collect();

            let mut tx = self.store.transact().await?;
            let user_rows = tx.delete_user_permissions(args.user_id).await?;
            let repo_sets = tx.remove_user_from_repo_permissions(args.user_id).await?;
            let pending_rows = tx.delete_pending_permissions_for_aliases(&keys).await?;
            let sub_repo_rows = tx.delete_sub_repo_permissions(args.user_id).await?;
            tx.commit().await?;

            info!(
                user_rows,
                repo_sets,
                pending_rows,
                sub_repo_rows,
                "Revoked user permissions"
            );
            if self.metrics_enabled {
                Telemetry::record_revoke(user_rows + pending_rows + sub_repo_rows);
            }

            Ok(())
        })
        .await
    }

    /// Runs `operation` under the configured deadline and records its
    /// latency and failure.
    pub(crate) async fn observe<T, F>(&self, operation: &'static str, fut: F) -> PermsResult<T>
    where
        F: Future<Output = PermsResult<T>>
    {
        let timer = self.metrics_enabled.then(|| OperationTimer::new(operation));

        let result = match self.operation_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .unwrap_or_else(|_| {
                    Err(PermsError::DeadlineExceeded {
                        operation: operation.to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
                    })
                }),
            None => fut.await
        };

        if self.metrics_enabled {
            if let Err(e) = &result {
                Telemetry::record_error(operation, error_kind(e));
            }
        }
        if let Some(timer) = timer {
            timer.finish();
        }

        result
    }
}

fn error_kind(error: &PermsError) -> &'static str {
    match error {
        PermsError::Database(_) => "database",
        PermsError::Query { .. } => "query",
        PermsError::Transaction { .. } => "transaction",
        PermsError::UserNotFound { .. } => "user_not_found",
        PermsError::InvalidPattern { .. } => "invalid_pattern",
        PermsError::DeadlineExceeded { .. } => "deadline_exceeded",
        PermsError::Configuration { .. } => "configuration",
        PermsError::Serialization(_) => "serialization"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authz_core::{Identity, UserEmail};
    use storage::{InMemoryIdentityStore, InMemoryPermsStore};

    fn engine(mode: BindMode) -> (AuthzEngine, Arc<InMemoryPermsStore>, Arc<InMemoryIdentityStore>) {
        let store = Arc::new(InMemoryPermsStore::new());
        let identities = Arc::new(InMemoryIdentityStore::new());
        let engine = AuthzEngine::new(store.clone(), identities.clone(), Arc::new(mode));
        (engine, store, identities)
    }

    #[test]
    fn test_revoke_args_from_identity() {
        let mut identity = Identity::new(UserId::new(1));
        identity.username = Some("alice".to_string());
        identity.emails.push(UserEmail {
            email: "alice@example.com".to_string(),
            verified: false
        });

        let args = RevokeUserPermissionsArgs::from_identity(&identity);
        assert_eq!(args.user_id, UserId::new(1));
        assert_eq!(args.accounts.len(), 1);
        assert_eq!(args.accounts[0].bind_ids, vec!["alice@example.com", "alice"]);
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(
            error_kind(&PermsError::UserNotFound { user_id: 1 }),
            "user_not_found"
        );
        assert_eq!(
            error_kind(&PermsError::transaction("memory", "boom")),
            "transaction"
        );
    }

    #[tokio::test]
    async fn test_grant_unknown_user_fails() {
        let (engine, _, _) = engine(BindMode::Email);
        let err = engine
            .grant_pending_permissions(&GrantPendingPermissionsArgs::new(
                UserId::new(404),
                Perms::Read,
                PermType::Repos
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, PermsError::UserNotFound { user_id: 404 }));
    }

    #[tokio::test]
    async fn test_grant_without_candidates_is_a_noop() {
        let (engine, store, identities) = engine(BindMode::Email);
        identities.create_user(UserId::new(1), "alice");

        let outcome = engine
            .grant_pending_permissions(&GrantPendingPermissionsArgs::new(
                UserId::new(1),
                Perms::Read,
                PermType::Repos
            ))
            .await
            .unwrap();
        assert_eq!(outcome, GrantOutcome::empty(BindMode::Email, 0));

        let perms = store
            .load_user_permissions(UserId::new(1), Perms::Read, PermType::Repos)
            .await
            .unwrap();
        assert!(perms.is_none());
    }

    #[tokio::test]
    async fn test_authorized_repos_empty_input() {
        let (engine, _, _) = engine(BindMode::Unset);
        let repos: Vec<RepoId> = engine
            .authorized_repos(
                &AuthorizedReposArgs::new(UserId::new(1), Perms::Read, PermType::Repos),
                Vec::new()
            )
            .await
            .unwrap();
        assert!(repos.is_empty());
    }
}
