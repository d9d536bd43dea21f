use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use strum::{Display, EnumString};

/// Service type and service id shared by every bind key addressed to an
/// internal contact alias (email or username) rather than a code host account.
pub const INTERNAL_SERVICE_TYPE: &str = "internal";
pub const INTERNAL_SERVICE_ID: &str = "internal";

macro_rules! int_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize
        )]
        #[serde(transparent)]
        pub struct $name(i32);

        impl $name {
            pub const fn new(id: i32) -> Self {
                Self(id)
            }

            pub const fn get(self) -> i32 {
                self.0
            }
        }

        impl From<i32> for $name {
            fn from(id: i32) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

int_id!(UserId);
int_id!(RepoId);
int_id!(ExternalAccountId);

/// Permission kind carried by every effective and pending set.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Perms {
    Read,
    Write
}

impl Perms {
    pub const ALL: [Perms; 2] = [Perms::Read, Perms::Write];
}

/// Resource type a user-centric permission set points at.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PermType {
    Repos
}

impl PermType {
    pub const ALL: [PermType; 1] = [PermType::Repos];
}

/// Which identity fact binds pending permissions to a user.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BindMode {
    /// Verified emails, internal sentinel service.
    Email,
    /// The username, internal sentinel service.
    Username,
    /// External accounts with their real service type and id.
    #[default]
    Unset
}

/// Provider context a bind id is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindKeyGroup {
    pub service_type: String,
    pub service_id: String
}

impl BindKeyGroup {
    pub fn new(service_type: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into()
        }
    }

    pub fn internal() -> Self {
        Self::new(INTERNAL_SERVICE_TYPE, INTERNAL_SERVICE_ID)
    }

    pub fn is_internal(&self) -> bool {
        self.service_type == INTERNAL_SERVICE_TYPE && self.service_id == INTERNAL_SERVICE_ID
    }

    pub fn key(&self, bind_id: impl Into<String>) -> BindKey {
        BindKey {
            service_type: self.service_type.clone(),
            service_id: self.service_id.clone(),
            bind_id: bind_id.into()
        }
    }
}

/// An unresolved principal: an alias scoped to a provider context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindKey {
    pub service_type: String,
    pub service_id: String,
    pub bind_id: String
}

impl BindKey {
    pub fn new(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        bind_id: impl Into<String>
    ) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into(),
            bind_id: bind_id.into()
        }
    }

    pub fn internal(bind_id: impl Into<String>) -> Self {
        BindKeyGroup::internal().key(bind_id)
    }

    pub fn group(&self) -> BindKeyGroup {
        BindKeyGroup::new(self.service_type.clone(), self.service_id.clone())
    }
}

impl std::fmt::Display for BindKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.service_type, self.service_id, self.bind_id)
    }
}

/// A batch of bind ids sharing one provider context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindAccounts {
    pub group: BindKeyGroup,
    pub bind_ids: Vec<String>
}

impl BindAccounts {
    pub fn new(group: BindKeyGroup, bind_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            group,
            bind_ids: bind_ids.into_iter().map(Into::into).collect()
        }
    }

    pub fn internal(bind_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(BindKeyGroup::internal(), bind_ids)
    }

    pub fn bind_keys(&self) -> impl Iterator<Item = BindKey> + '_ {
        self.bind_ids.iter().map(|id| self.group.key(id.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalAccountSpec {
    pub service_type: String,
    pub service_id: String,
    pub account_id: String
}

impl ExternalAccountSpec {
    pub fn new(
        service_type: impl Into<String>,
        service_id: impl Into<String>,
        account_id: impl Into<String>
    ) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: service_id.into(),
            account_id: account_id.into()
        }
    }

    pub fn bind_key(&self) -> BindKey {
        BindKey::new(
            self.service_type.clone(),
            self.service_id.clone(),
            self.account_id.clone()
        )
    }
}

/// An external account linked to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccount {
    pub id: ExternalAccountId,
    pub spec: ExternalAccountSpec
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEmail {
    pub email: String,
    pub verified: bool
}

/// Identity facts of a user, as reported by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: Option<String>,
    pub emails: Vec<UserEmail>,
    pub external_accounts: Vec<ExternalAccount>
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            username: None,
            emails: Vec::new(),
            external_accounts: Vec::new()
        }
    }

    pub fn verified_emails(&self) -> impl Iterator<Item = &str> {
        self.emails
            .iter()
            .filter(|e| e.verified)
            .map(|e| e.email.as_str())
    }

    pub fn unverified_emails(&self) -> impl Iterator<Item = &str> {
        self.emails
            .iter()
            .filter(|e| !e.verified)
            .map(|e| e.email.as_str())
    }

    /// Every alias that may ever have addressed this user, regardless of
    /// verification or binding mode. Callers snapshot this before deleting
    /// the identity and pass it to revocation.
    pub fn revocation_aliases(&self) -> Vec<BindAccounts> {
        let mut internal: Vec<String> = self.emails.iter().map(|e| e.email.clone()).collect();
        if let Some(username) = &self.username {
            internal.push(username.clone());
        }

        let mut aliases = vec![BindAccounts::internal(internal)];
        for account in &self.external_accounts {
            let group = BindKeyGroup::new(
                account.spec.service_type.clone(),
                account.spec.service_id.clone()
            );
            match aliases.iter_mut().find(|a| a.group == group) {
                Some(existing) => existing.bind_ids.push(account.spec.account_id.clone()),
                None => aliases.push(BindAccounts::new(group, [account.spec.account_id.clone()]))
            }
        }
        aliases
    }
}

/// A repository reference handed to access checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub name: String
}

impl Repo {
    pub fn new(id: impl Into<RepoId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into()
        }
    }
}

/// Anything that can be filtered by repository-level permissions.
pub trait HasRepoId {
    fn repo_id(&self) -> RepoId;
}

impl HasRepoId for RepoId {
    fn repo_id(&self) -> RepoId {
        *self
    }
}

impl HasRepoId for Repo {
    fn repo_id(&self) -> RepoId {
        self.id
    }
}

impl<T: HasRepoId> HasRepoId for &T {
    fn repo_id(&self) -> RepoId {
        (*self).repo_id()
    }
}

/// Repositories a user may access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPermissions {
    pub user_id: UserId,
    pub perm: Perms,
    pub perm_type: PermType,
    pub ids: BTreeSet<RepoId>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>
}

impl UserPermissions {
    pub fn new(user_id: UserId, perm: Perms, perm_type: PermType) -> Self {
        Self {
            user_id,
            perm,
            perm_type,
            ids: BTreeSet::new(),
            updated_at: Utc::now(),
            synced_at: None
        }
    }
}

/// Users who may access a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoPermissions {
    pub repo_id: RepoId,
    pub perm: Perms,
    pub user_ids: BTreeSet<UserId>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>
}

impl RepoPermissions {
    pub fn new(repo_id: RepoId, perm: Perms) -> Self {
        Self {
            repo_id,
            perm,
            user_ids: BTreeSet::new(),
            updated_at: Utc::now(),
            synced_at: None
        }
    }
}

/// Repositories an unresolved alias may access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPendingPermissions {
    pub key: BindKey,
    pub perm: Perms,
    pub perm_type: PermType,
    pub ids: BTreeSet<RepoId>,
    pub updated_at: DateTime<Utc>
}

impl UserPendingPermissions {
    pub fn new(key: BindKey, perm: Perms, perm_type: PermType) -> Self {
        Self {
            key,
            perm,
            perm_type,
            ids: BTreeSet::new(),
            updated_at: Utc::now()
        }
    }
}

/// Aliases of one provider context that may access a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoPendingPermissions {
    pub repo_id: RepoId,
    pub perm: Perms,
    pub group: BindKeyGroup,
    pub bind_ids: BTreeSet<String>,
    pub updated_at: DateTime<Utc>
}

impl RepoPendingPermissions {
    pub fn new(repo_id: RepoId, perm: Perms, group: BindKeyGroup) -> Self {
        Self {
            repo_id,
            perm,
            group,
            bind_ids: BTreeSet::new(),
            updated_at: Utc::now()
        }
    }
}

/// Ordered path rules restricting a user inside one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRepoPermissions {
    pub paths: Vec<String>
}

impl SubRepoPermissions {
    pub fn new(paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect()
        }
    }
}

/// Where a user's access to a repository came from.
///
/// A user keeps a repository while at least one source still grants it.
/// Each writer replaces only its own source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermsSource {
    /// Repository-centric sync
    RepoSync,
    /// Pending permissions bound to the user
    Grant,
    /// User-centric sync of one linked external account
    ExternalAccount(ExternalAccountId)
}

/// Outcome of a full-replace write. `added` and `removed` count changes to
/// effective access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermsDiff {
    pub added: usize,
    pub removed: usize,
    /// Whether a record existed before the write.
    pub found: bool
}
