use crate::perms::{PermsStore, PermsTransaction};
use async_trait::async_trait;
use authz_core::{
    BindKey, BindKeyGroup, ExternalAccountId, PermType, Perms, PermsSource, RepoId,
    RepoPendingPermissions, RepoPermissions, SubRepoPermissions, UserId, UserPendingPermissions,
    UserPermissions
};
use chrono::{DateTime, Utc};
use errors::{PermsError, PermsResult};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Pool, Postgres, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const BACKEND: &str = "postgres";

// Advisory lock namespaces, one per kind of key a write reads before it
// rewrites.
const LOCK_USER: i32 = 1;
const LOCK_REPO: i32 = 2;
const LOCK_BIND_KEY: i32 = 3;
const LOCK_REPO_PENDING: i32 = 4;

pub struct PostgresPermsStore {
    pool: Pool<Postgres>
}

impl PostgresPermsStore {
    pub async fn new(connection_url: &str) -> PermsResult<Self> {
        let pool = Pool::connect(connection_url).await?;
        Ok(Self { pool })
    }

    pub async fn with_options(
        connection_url: &str,
        max_connections: u32,
        acquire_timeout: Duration
    ) -> PermsResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(connection_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> PermsResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_permissions (
                user_id INTEGER NOT NULL,
                permission TEXT NOT NULL,
                object_type TEXT NOT NULL,
                object_ids INTEGER[] NOT NULL DEFAULT '{}',
                updated_at TIMESTAMPTZ NOT NULL,
                synced_at TIMESTAMPTZ,
                PRIMARY KEY (user_id, permission, object_type)
            )"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS repo_permissions (
                repo_id INTEGER NOT NULL,
                permission TEXT NOT NULL,
                user_ids INTEGER[] NOT NULL DEFAULT '{}',
                updated_at TIMESTAMPTZ NOT NULL,
                synced_at TIMESTAMPTZ,
                PRIMARY KEY (repo_id, permission)
            )"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_repo_permissions_user_ids
             ON repo_permissions USING GIN (user_ids)"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_pending_permissions (
                service_type TEXT NOT NULL,
                service_id TEXT NOT NULL,
                bind_id TEXT NOT NULL,
                permission TEXT NOT NULL,
                object_type TEXT NOT NULL,
                object_ids INTEGER[] NOT NULL DEFAULT '{}',
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (service_type, service_id, bind_id, permission, object_type)
            )"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS repo_pending_permissions (
                repo_id INTEGER NOT NULL,
                permission TEXT NOT NULL,
                service_type TEXT NOT NULL,
                service_id TEXT NOT NULL,
                bind_ids TEXT[] NOT NULL DEFAULT '{}',
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (repo_id, permission, service_type, service_id)
            )"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS user_repo_permissions (
                user_id INTEGER NOT NULL,
                repo_id INTEGER NOT NULL,
                permission TEXT NOT NULL,
                source TEXT NOT NULL,
                external_account_id INTEGER NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, repo_id, permission, source, external_account_id)
            )"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_user_repo_permissions_repo
             ON user_repo_permissions (repo_id, permission)"
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sub_repo_permissions (
                user_id INTEGER NOT NULL,
                repo_id INTEGER NOT NULL,
                paths TEXT[] NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, repo_id)
            )"
        )
        .execute(&self.pool)
        .await?;

        info!("Permission store schema initialized");
        Ok(())
    }
}

#[async_trait]
impl PermsStore for PostgresPermsStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn transact(&self) -> PermsResult<Box<dyn PermsTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresPermsTransaction { tx }))
    }
}

pub struct PostgresPermsTransaction {
    tx: Transaction<'static, Postgres>
}

fn parse_perm(value: &str) -> PermsResult<Perms> {
    Perms::from_str(value).map_err(|e| PermsError::query(BACKEND, format!("{value}: {e}")))
}

fn parse_perm_type(value: &str) -> PermsResult<PermType> {
    PermType::from_str(value).map_err(|e| PermsError::query(BACKEND, format!("{value}: {e}")))
}

fn repo_ids(values: Vec<i32>) -> BTreeSet<RepoId> {
    values.into_iter().map(RepoId::new).collect()
}

fn repo_ids_column(ids: &BTreeSet<RepoId>) -> Vec<i32> {
    ids.iter().map(|id| id.get()).collect()
}

fn source_columns(source: PermsSource) -> (&'static str, i32) {
    match source {
        PermsSource::RepoSync => ("repo_sync", 0),
        PermsSource::Grant => ("grant", 0),
        PermsSource::ExternalAccount(id) => ("external_account", id.get())
    }
}

fn source_from_columns(source: &str, account_id: i32) -> PermsResult<PermsSource> {
    match source {
        "repo_sync" => Ok(PermsSource::RepoSync),
        "grant" => Ok(PermsSource::Grant),
        "external_account" => Ok(PermsSource::ExternalAccount(ExternalAccountId::new(
            account_id
        ))),
        other => Err(PermsError::query(
            BACKEND,
            format!("unknown permission source: {other}")
        ))
    }
}

fn user_permissions_from_row(row: &PgRow) -> PermsResult<UserPermissions> {
    let permission: String = row.try_get("permission")?;
    let object_type: String = row.try_get("object_type")?;
    Ok(UserPermissions {
        user_id: UserId::new(row.try_get("user_id")?),
        perm: parse_perm(&permission)?,
        perm_type: parse_perm_type(&object_type)?,
        ids: repo_ids(row.try_get("object_ids")?),
        updated_at: row.try_get("updated_at")?,
        synced_at: row.try_get::<Option<DateTime<Utc>>, _>("synced_at")?
    })
}

fn user_pending_from_row(row: &PgRow) -> PermsResult<UserPendingPermissions> {
    let permission: String = row.try_get("permission")?;
    let object_type: String = row.try_get("object_type")?;
    Ok(UserPendingPermissions {
        key: BindKey::new(
            row.try_get::<String, _>("service_type")?,
            row.try_get::<String, _>("service_id")?,
            row.try_get::<String, _>("bind_id")?
        ),
        perm: parse_perm(&permission)?,
        perm_type: parse_perm_type(&object_type)?,
        ids: repo_ids(row.try_get("object_ids")?),
        updated_at: row.try_get("updated_at")?
    })
}

impl PostgresPermsTransaction {
    /// Takes a transaction-scoped advisory lock. Loads lock their key before
    /// reading, so two writers of the same key run one after the other even
    /// when its row does not exist yet.
    async fn lock_key(&mut self, namespace: i32, key: i32) -> PermsResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(namespace)
            .bind(key)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn lock_bind_key(&mut self, key: &BindKey) -> PermsResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
            .bind(LOCK_BIND_KEY)
            .bind(key.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PermsTransaction for PostgresPermsTransaction {
    async fn load_user_permissions(
        &mut self,
        user_id: UserId,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<Option<UserPermissions>> {
        self.lock_key(LOCK_USER, user_id.get()).await?;
        let row = sqlx::query(
            "SELECT user_id, permission, object_type, object_ids, updated_at, synced_at
             FROM user_permissions
             WHERE user_id = $1 AND permission = $2 AND object_type = $3
             FOR UPDATE"
        )
        .bind(user_id.get())
        .bind(perm.to_string())
        .bind(perm_type.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(user_permissions_from_row).transpose()
    }

    async fn save_user_permissions(&mut self, perms: &UserPermissions) -> PermsResult<()> {
        sqlx::query(
            "INSERT INTO user_permissions
                (user_id, permission, object_type, object_ids, updated_at, synced_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (user_id, permission, object_type) DO UPDATE
             SET object_ids = EXCLUDED.object_ids,
                 updated_at = EXCLUDED.updated_at,
                 synced_at = COALESCE(EXCLUDED.synced_at, user_permissions.synced_at)"
        )
        .bind(perms.user_id.get())
        .bind(perms.perm.to_string())
        .bind(perms.perm_type.to_string())
        .bind(repo_ids_column(&perms.ids))
        .bind(perms.updated_at)
        .bind(perms.synced_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_user_permissions_rows(&mut self, user_id: UserId) -> PermsResult<usize> {
        self.lock_key(LOCK_USER, user_id.get()).await?;
        let result = sqlx::query("DELETE FROM user_permissions WHERE user_id = $1")
            .bind(user_id.get())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn load_repo_permissions(
        &mut self,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<Option<RepoPermissions>> {
        self.lock_key(LOCK_REPO, repo_id.get()).await?;
        let row = sqlx::query(
            "SELECT user_ids, updated_at, synced_at
             FROM repo_permissions
             WHERE repo_id = $1 AND permission = $2
             FOR UPDATE"
        )
        .bind(repo_id.get())
        .bind(perm.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let user_ids: Vec<i32> = row.try_get("user_ids")?;
        Ok(Some(RepoPermissions {
            repo_id,
            perm,
            user_ids: user_ids.into_iter().map(UserId::new).collect(),
            updated_at: row.try_get("updated_at")?,
            synced_at: row.try_get::<Option<DateTime<Utc>>, _>("synced_at")?
        }))
    }

    async fn save_repo_permissions(&mut self, perms: &RepoPermissions) -> PermsResult<()> {
        let user_ids: Vec<i32> = perms.user_ids.iter().map(|id| id.get()).collect();
        sqlx::query(
            "INSERT INTO repo_permissions (repo_id, permission, user_ids, updated_at, synced_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (repo_id, permission) DO UPDATE
             SET user_ids = EXCLUDED.user_ids,
                 updated_at = EXCLUDED.updated_at,
                 synced_at = COALESCE(EXCLUDED.synced_at, repo_permissions.synced_at)"
        )
        .bind(perms.repo_id.get())
        .bind(perms.perm.to_string())
        .bind(user_ids)
        .bind(perms.updated_at)
        .bind(perms.synced_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove_user_from_repo_permissions(&mut self, user_id: UserId) -> PermsResult<usize> {
        let result = sqlx::query(
            "UPDATE repo_permissions
             SET user_ids = array_remove(user_ids, $1), updated_at = $2
             WHERE $1 = ANY(user_ids)"
        )
        .bind(user_id.get())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn load_user_pending_permissions(
        &mut self,
        key: &BindKey,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<Option<UserPendingPermissions>> {
        self.lock_bind_key(key).await?;
        let row = sqlx::query(
            "SELECT service_type, service_id, bind_id, permission, object_type, object_ids, updated_at
             FROM user_pending_permissions
             WHERE service_type = $1 AND service_id = $2 AND bind_id = $3
               AND permission = $4 AND object_type = $5
             FOR UPDATE"
        )
        .bind(&key.service_type)
        .bind(&key.service_id)
        .bind(&key.bind_id)
        .bind(perm.to_string())
        .bind(perm_type.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(user_pending_from_row).transpose()
    }

    async fn list_user_pending_permissions(
        &mut self,
        key: &BindKey
    ) -> PermsResult<Vec<UserPendingPermissions>> {
        self.lock_bind_key(key).await?;
        let rows = sqlx::query(
            "SELECT service_type, service_id, bind_id, permission, object_type, object_ids, updated_at
             FROM user_pending_permissions
             WHERE service_type = $1 AND service_id = $2 AND bind_id = $3
             ORDER BY permission, object_type
             FOR UPDATE"
        )
        .bind(&key.service_type)
        .bind(&key.service_id)
        .bind(&key.bind_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(user_pending_from_row).collect()
    }

    async fn save_user_pending_permissions(
        &mut self,
        perms: &UserPendingPermissions
    ) -> PermsResult<()> {
        sqlx::query(
            "INSERT INTO user_pending_permissions
                (service_type, service_id, bind_id, permission, object_type, object_ids, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (service_type, service_id, bind_id, permission, object_type) DO UPDATE
             SET object_ids = EXCLUDED.object_ids, updated_at = EXCLUDED.updated_at"
        )
        .bind(&perms.key.service_type)
        .bind(&perms.key.service_id)
        .bind(&perms.key.bind_id)
        .bind(perms.perm.to_string())
        .bind(perms.perm_type.to_string())
        .bind(repo_ids_column(&perms.ids))
        .bind(perms.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_user_pending_permissions_row(
        &mut self,
        key: &BindKey,
        perm: Perms,
        perm_type: PermType
    ) -> PermsResult<()> {
        sqlx::query(
            "DELETE FROM user_pending_permissions
             WHERE service_type = $1 AND service_id = $2 AND bind_id = $3
               AND permission = $4 AND object_type = $5"
        )
        .bind(&key.service_type)
        .bind(&key.service_id)
        .bind(&key.bind_id)
        .bind(perm.to_string())
        .bind(perm_type.to_string())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn load_repo_pending_permissions(
        &mut self,
        repo_id: RepoId,
        perm: Perms,
        group: &BindKeyGroup
    ) -> PermsResult<Option<RepoPendingPermissions>> {
        self.lock_key(LOCK_REPO_PENDING, repo_id.get()).await?;
        let row = sqlx::query(
            "SELECT bind_ids, updated_at
             FROM repo_pending_permissions
             WHERE repo_id = $1 AND permission = $2 AND service_type = $3 AND service_id = $4
             FOR UPDATE"
        )
        .bind(repo_id.get())
        .bind(perm.to_string())
        .bind(&group.service_type)
        .bind(&group.service_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let bind_ids: Vec<String> = row.try_get("bind_ids")?;
        Ok(Some(RepoPendingPermissions {
            repo_id,
            perm,
            group: group.clone(),
            bind_ids: bind_ids.into_iter().collect(),
            updated_at: row.try_get("updated_at")?
        }))
    }

    async fn save_repo_pending_permissions(
        &mut self,
        perms: &RepoPendingPermissions
    ) -> PermsResult<()> {
        let bind_ids: Vec<String> = perms.bind_ids.iter().cloned().collect();
        sqlx::query(
            "INSERT INTO repo_pending_permissions
                (repo_id, permission, service_type, service_id, bind_ids, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (repo_id, permission, service_type, service_id) DO UPDATE
             SET bind_ids = EXCLUDED.bind_ids, updated_at = EXCLUDED.updated_at"
        )
        .bind(perms.repo_id.get())
        .bind(perms.perm.to_string())
        .bind(&perms.group.service_type)
        .bind(&perms.group.service_id)
        .bind(bind_ids)
        .bind(perms.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    // Source rows of a user are only written under that user's lock.
    async fn load_user_repo_sources(
        &mut self,
        user_id: UserId,
        perm: Perms
    ) -> PermsResult<BTreeMap<RepoId, BTreeSet<PermsSource>>> {
        self.lock_key(LOCK_USER, user_id.get()).await?;
        let rows = sqlx::query_as::<_, (i32, String, i32)>(
            "SELECT repo_id, source, external_account_id
             FROM user_repo_permissions
             WHERE user_id = $1 AND permission = $2"
        )
        .bind(user_id.get())
        .bind(perm.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        let mut sources: BTreeMap<RepoId, BTreeSet<PermsSource>> = BTreeMap::new();
        for (repo_id, source, account_id) in rows {
            sources
                .entry(RepoId::new(repo_id))
                .or_default()
                .insert(source_from_columns(&source, account_id)?);
        }
        Ok(sources)
    }

    async fn load_repo_user_sources(
        &mut self,
        repo_id: RepoId,
        perm: Perms
    ) -> PermsResult<BTreeMap<UserId, BTreeSet<PermsSource>>> {
        self.lock_key(LOCK_REPO, repo_id.get()).await?;
        let rows = sqlx::query_as::<_, (i32, String, i32)>(
            "SELECT user_id, source, external_account_id
             FROM user_repo_permissions
             WHERE repo_id = $1 AND permission = $2"
        )
        .bind(repo_id.get())
        .bind(perm.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        let mut sources: BTreeMap<UserId, BTreeSet<PermsSource>> = BTreeMap::new();
        for (user_id, source, account_id) in rows {
            sources
                .entry(UserId::new(user_id))
                .or_default()
                .insert(source_from_columns(&source, account_id)?);
        }
        Ok(sources)
    }

    async fn add_user_repo_source(
        &mut self,
        user_id: UserId,
        perm: Perms,
        repo_id: RepoId,
        source: PermsSource
    ) -> PermsResult<()> {
        let (source, account_id) = source_columns(source);
        sqlx::query(
            "INSERT INTO user_repo_permissions
                (user_id, repo_id, permission, source, external_account_id, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (user_id, repo_id, permission, source, external_account_id) DO UPDATE
             SET updated_at = EXCLUDED.updated_at"
        )
        .bind(user_id.get())
        .bind(repo_id.get())
        .bind(perm.to_string())
        .bind(source)
        .bind(account_id)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove_user_repo_source(
        &mut self,
        user_id: UserId,
        perm: Perms,
        repo_id: RepoId,
        source: PermsSource
    ) -> PermsResult<()> {
        let (source, account_id) = source_columns(source);
        sqlx::query(
            "DELETE FROM user_repo_permissions
             WHERE user_id = $1 AND repo_id = $2 AND permission = $3
               AND source = $4 AND external_account_id = $5"
        )
        .bind(user_id.get())
        .bind(repo_id.get())
        .bind(perm.to_string())
        .bind(source)
        .bind(account_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_user_repo_sources(&mut self, user_id: UserId) -> PermsResult<usize> {
        let result = sqlx::query("DELETE FROM user_repo_permissions WHERE user_id = $1")
            .bind(user_id.get())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn upsert_sub_repo_permissions(
        &mut self,
        user_id: UserId,
        repo_id: RepoId,
        perms: &SubRepoPermissions
    ) -> PermsResult<()> {
        sqlx::query(
            "INSERT INTO sub_repo_permissions (user_id, repo_id, paths, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id, repo_id) DO UPDATE
             SET paths = EXCLUDED.paths, updated_at = EXCLUDED.updated_at"
        )
        .bind(user_id.get())
        .bind(repo_id.get())
        .bind(&perms.paths)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_sub_repo_permissions_by_user(
        &mut self,
        user_id: UserId
    ) -> PermsResult<BTreeMap<RepoId, SubRepoPermissions>> {
        let rows = sqlx::query_as::<_, (i32, Vec<String>)>(
            "SELECT repo_id, paths FROM sub_repo_permissions WHERE user_id = $1"
        )
        .bind(user_id.get())
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(repo_id, paths)| (RepoId::new(repo_id), SubRepoPermissions { paths }))
            .collect())
    }

    async fn delete_sub_repo_permissions(&mut self, user_id: UserId) -> PermsResult<usize> {
        let result = sqlx::query("DELETE FROM sub_repo_permissions WHERE user_id = $1")
            .bind(user_id.get())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn commit(self: Box<Self>) -> PermsResult<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}
