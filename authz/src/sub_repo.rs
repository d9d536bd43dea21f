//! Sub-repository permission overlay.
//!
//! A user granted a repository may further be restricted to some of its
//! paths. Rules are glob patterns evaluated in order; a leading `-` turns a
//! rule into an exclusion. The first matching rule decides. When rules exist
//! and none match, the path is denied. A repository without rules is
//! unrestricted.

use crate::engine::{AuthorizedReposArgs, AuthzEngine};
use crate::telemetry::Telemetry;
use authz_core::{PermType, Perms, RepoId, SubRepoPermissions, UserId};
use errors::{PermsError, PermsResult};
use glob::{MatchOptions, Pattern};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

const EXCLUDE_PREFIX: char = '-';

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false
};

#[derive(Debug, Clone)]
struct SubRepoRule {
    pattern: Pattern,
    exclude: bool
}

/// Compiled rules of one (user, repository) pair.
#[derive(Debug, Clone)]
pub struct SubRepoRules {
    rules: Vec<SubRepoRule>
}

impl SubRepoRules {
    /// Fails with `PermsError::InvalidPattern` on the first malformed rule.
    pub fn compile(perms: &SubRepoPermissions) -> PermsResult<Self> {
        let rules = perms
            .paths
            .iter()
            .map(|raw| compile_rule(raw))
            .collect::<PermsResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        let path = normalize(path);
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches_with(&path, MATCH_OPTIONS))
            .is_some_and(|rule| !rule.exclude)
    }
}

fn compile_rule(raw: &str) -> PermsResult<SubRepoRule> {
    let (exclude, body) = match raw.strip_prefix(EXCLUDE_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, raw)
    };

    if body.trim().is_empty() {
        return Err(PermsError::InvalidPattern {
            pattern: raw.to_string(),
            reason: "empty pattern".to_string()
        });
    }

    let pattern = Pattern::new(&normalize(body)).map_err(|e| PermsError::InvalidPattern {
        pattern: raw.to_string(),
        reason: e.to_string()
    })?;

    Ok(SubRepoRule { pattern, exclude })
}

fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

impl AuthzEngine {
    /// Validates the rules, then replaces the user's rules for the
    /// repository.
    #[instrument(skip(self, perms), fields(user_id = %user_id, repo_id = %repo_id, rules = perms.paths.len()))]
    pub async fn upsert_sub_repo_permissions(
        &self,
        user_id: UserId,
        repo_id: RepoId,
        perms: &SubRepoPermissions
    ) -> PermsResult<()> {
        SubRepoRules::compile(perms)?;
        self.observe("upsert_sub_repo", async {
            self.store()
                .upsert_sub_repo_permissions(user_id, repo_id, perms)
                .await
        })
        .await
    }

    /// Rules of every restricted repository of the user. Repositories absent
    /// from the map are unrestricted.
    pub async fn get_sub_repo_permissions_by_user(
        &self,
        user_id: UserId
    ) -> PermsResult<BTreeMap<RepoId, SubRepoPermissions>> {
        self.observe("get_sub_repo", async {
            self.store().get_sub_repo_permissions_by_user(user_id).await
        })
        .await
    }

    /// Whether the user may read `path` in the repository. Requires the
    /// repository-level grant first.
    pub async fn can_read_path(
        &self,
        user_id: UserId,
        perm: Perms,
        repo_id: RepoId,
        path: &str
    ) -> PermsResult<bool> {
        let allowed = self.filter_paths(user_id, perm, repo_id, vec![path]).await?;
        Ok(!allowed.is_empty())
    }

    /// The readable subset of `paths`, in input order.
    #[instrument(skip(self, paths), fields(user_id = %user_id, repo_id = %repo_id, paths = paths.len()))]
    pub async fn filter_paths<S: AsRef<str>>(
        &self,
        user_id: UserId,
        perm: Perms,
        repo_id: RepoId,
        paths: Vec<S>
    ) -> PermsResult<Vec<S>> {
        if paths.is_empty() {
            return Ok(paths);
        }

        let granted = self
            .authorized_repos(
                &AuthorizedReposArgs::new(user_id, perm, PermType::Repos),
                vec![repo_id]
            )
            .await?;
        if granted.is_empty() {
            debug!("Repository not granted, denying every path");
            return Ok(Vec::new());
        }

        let mut by_repo = self.get_sub_repo_permissions_by_user(user_id).await?;
        let Some(perms) = by_repo.remove(&repo_id) else {
            return Ok(paths);
        };

        let rules = SubRepoRules::compile(&perms)?;
        let total = paths.len();
        let allowed: Vec<S> = paths
            .into_iter()
            .filter(|path| rules.is_allowed(path.as_ref()))
            .collect();

        if self.metrics_enabled() && allowed.len() < total {
            Telemetry::record_paths_denied(total - allowed.len());
        }
        Ok(allowed)
    }
}
