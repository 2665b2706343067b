use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::Store;
use super::schema::SCHEMA;
use crate::error::{Error, Result};
use crate::types::*;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Handle SQLite's default datetime format: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            tracing::error!("Invalid datetime in database: '{}' - {}", s, e);
            Utc::now()
        })
}

/// Fixed-width so that text ordering in SQL matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn column_enum<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown value '{raw}'").into(),
        )
    })
}

const TENANT_COLUMNS: &str = "id, name, source_repository, public, created_at";

fn row_to_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        source_repository: row.get(2)?,
        public: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

const USER_COLUMNS: &str = "id, name, global_role, created_at";

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        global_role: column_enum(row, 2, GlobalRole::parse)?,
        created_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

const DEPLOY_KEY_COLUMNS: &str =
    "id, tenant_id, key_hash, key_lookup, capability, created_at, last_used_at, revoked_at";

fn row_to_deploy_key(row: &Row<'_>) -> rusqlite::Result<DeployKey> {
    Ok(DeployKey {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        key_hash: row.get(2)?,
        key_lookup: row.get(3)?,
        capability: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        last_used_at: parse_optional_datetime(row.get(6)?),
        revoked_at: parse_optional_datetime(row.get(7)?),
    })
}

const RUNNER_TOKEN_COLUMNS: &str =
    "id, tenant_id, token_prefix, salt, token_hash, created_at, expires_at, revoked_at";

fn row_to_runner_token(row: &Row<'_>) -> rusqlite::Result<RunnerToken> {
    Ok(RunnerToken {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        token_prefix: row.get(2)?,
        salt: row.get(3)?,
        token_hash: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        expires_at: parse_optional_datetime(row.get(6)?),
        revoked_at: parse_optional_datetime(row.get(7)?),
    })
}

const BUILD_COLUMNS: &str = "id, tenant_id, version, commit_hash, artifact_key, artifact_size, \
     platform_version, loader, loader_version, force_reinstall, created_at";

fn row_to_build(row: &Row<'_>) -> rusqlite::Result<Build> {
    Ok(Build {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        version: row.get(2)?,
        commit_hash: row.get(3)?,
        artifact_key: row.get(4)?,
        artifact_size: row.get(5)?,
        metadata: BuildMetadata {
            platform_version: row.get(6)?,
            loader: row.get(7)?,
            loader_version: row.get(8)?,
        },
        force_reinstall: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn row_to_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        tenant_id: row.get(0)?,
        name: column_enum(row, 1, ChannelName::parse)?,
        build_id: row.get(2)?,
        updated_at: parse_datetime(&row.get::<_, String>(3)?),
    })
}

fn upsert_channel_row(conn: &Connection, channel: &Channel) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO channels (tenant_id, channel, build_id, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(tenant_id, channel) DO UPDATE SET
             build_id = excluded.build_id,
             updated_at = excluded.updated_at",
        params![
            channel.tenant_id,
            channel.name.as_str(),
            channel.build_id,
            format_datetime(&channel.updated_at),
        ],
    )
}

impl Store for SqliteStore {
    fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    // Tenant operations

    fn create_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.conn().execute(
            "INSERT INTO tenants (id, name, source_repository, public, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant.id,
                tenant.name,
                tenant.source_repository,
                tenant.public,
                format_datetime(&tenant.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
            params![id],
            row_to_tenant,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_tenant)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_tenant(&self, tenant: &Tenant) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE tenants SET name = ?1, source_repository = ?2, public = ?3 WHERE id = ?4",
            params![tenant.name, tenant.source_repository, tenant.public, tenant.id],
        )?;

        if rows == 0 {
            return Err(Error::NotFound(format!("tenant '{}' not found", tenant.id)));
        }
        Ok(())
    }

    // User operations

    fn create_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, name, global_role, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                user.id,
                user.name,
                user.global_role.as_str(),
                format_datetime(&user.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id],
            row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_user_by_name(&self, name: &str) -> Result<Option<User>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE name = ?1"),
            params![name],
            row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    // Membership operations

    fn upsert_membership(&self, membership: &Membership) -> Result<()> {
        self.conn().execute(
            "INSERT INTO memberships (tenant_id, user_id, role, access_level)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tenant_id, user_id) DO UPDATE SET
                 role = excluded.role,
                 access_level = excluded.access_level",
            params![
                membership.tenant_id,
                membership.user_id,
                membership.role.as_str(),
                membership.access_level.as_str(),
            ],
        )?;
        Ok(())
    }

    fn get_membership(&self, tenant_id: &str, user_id: &str) -> Result<Option<Membership>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT tenant_id, user_id, role, access_level
             FROM memberships WHERE tenant_id = ?1 AND user_id = ?2",
            params![tenant_id, user_id],
            |row| {
                Ok(Membership {
                    tenant_id: row.get(0)?,
                    user_id: row.get(1)?,
                    role: column_enum(row, 2, Role::parse)?,
                    access_level: column_enum(row, 3, AccessLevel::parse)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn delete_membership(&self, tenant_id: &str, user_id: &str) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM memberships WHERE tenant_id = ?1 AND user_id = ?2",
            params![tenant_id, user_id],
        )?;
        Ok(rows > 0)
    }

    // User token operations

    fn create_user_token(&self, token: &UserToken) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_tokens (token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                token.token_hash,
                token.user_id,
                format_datetime(&token.created_at),
                format_datetime(&token.expires_at),
            ],
        )?;
        Ok(())
    }

    fn get_user_token(&self, token_hash: &str) -> Result<Option<UserToken>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT token_hash, user_id, created_at, expires_at
             FROM user_tokens WHERE token_hash = ?1",
            params![token_hash],
            |row| {
                Ok(UserToken {
                    token_hash: row.get(0)?,
                    user_id: row.get(1)?,
                    created_at: parse_datetime(&row.get::<_, String>(2)?),
                    expires_at: parse_datetime(&row.get::<_, String>(3)?),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    fn delete_expired_user_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM user_tokens WHERE expires_at <= ?1",
            params![format_datetime(&now)],
        )?;
        Ok(rows)
    }

    // Deploy key operations

    fn create_deploy_key(&self, key: &DeployKey) -> Result<()> {
        self.conn().execute(
            "INSERT INTO deploy_keys (id, tenant_id, key_hash, key_lookup, capability, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.id,
                key.tenant_id,
                key.key_hash,
                key.key_lookup,
                key.capability,
                format_datetime(&key.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_deploy_key_by_lookup(&self, lookup: &str) -> Result<Option<DeployKey>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {DEPLOY_KEY_COLUMNS} FROM deploy_keys WHERE key_lookup = ?1"),
            params![lookup],
            row_to_deploy_key,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_deploy_keys(&self, tenant_id: &str) -> Result<Vec<DeployKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEPLOY_KEY_COLUMNS} FROM deploy_keys WHERE tenant_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![tenant_id], row_to_deploy_key)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn revoke_deploy_key(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE deploy_keys SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![format_datetime(&at), id],
        )?;
        Ok(rows > 0)
    }

    fn update_deploy_key_last_used(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE deploy_keys SET last_used_at = ?1 WHERE id = ?2",
            params![format_datetime(&at), id],
        )?;
        Ok(())
    }

    // Runner token operations

    fn create_runner_token(&self, token: &RunnerToken) -> Result<()> {
        self.conn().execute(
            "INSERT INTO runner_tokens
                 (id, tenant_id, token_prefix, salt, token_hash, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.id,
                token.tenant_id,
                token.token_prefix,
                token.salt,
                token.token_hash,
                format_datetime(&token.created_at),
                token.expires_at.as_ref().map(format_datetime),
            ],
        )?;
        Ok(())
    }

    fn list_runner_tokens_by_prefix(&self, prefix: &str) -> Result<Vec<RunnerToken>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUNNER_TOKEN_COLUMNS} FROM runner_tokens WHERE token_prefix = ?1"
        ))?;
        let rows = stmt.query_map(params![prefix], row_to_runner_token)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_runner_tokens(&self, tenant_id: &str) -> Result<Vec<RunnerToken>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUNNER_TOKEN_COLUMNS} FROM runner_tokens WHERE tenant_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![tenant_id], row_to_runner_token)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn revoke_runner_token(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE runner_tokens SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
            params![format_datetime(&at), id],
        )?;
        Ok(rows > 0)
    }

    // Build operations

    fn get_build(&self, id: &str) -> Result<Option<Build>> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {BUILD_COLUMNS} FROM builds WHERE id = ?1"),
            params![id],
            row_to_build,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_builds(&self, tenant_id: &str) -> Result<Vec<Build>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE tenant_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map(params![tenant_id], row_to_build)?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn set_build_force_reinstall(&self, tenant_id: &str, id: &str, flag: bool) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE builds SET force_reinstall = ?1 WHERE id = ?2 AND tenant_id = ?3",
            params![flag, id, tenant_id],
        )?;
        Ok(rows > 0)
    }

    fn has_force_reinstall_between(
        &self,
        tenant_id: &str,
        after: DateTime<Utc>,
        up_to: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn();
        let found: bool = conn.query_row(
            "SELECT EXISTS(
                 SELECT 1 FROM builds
                 WHERE tenant_id = ?1 AND force_reinstall = 1
                   AND created_at > ?2 AND created_at <= ?3
             )",
            params![tenant_id, format_datetime(&after), format_datetime(&up_to)],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    // Channel operations

    fn get_channel(&self, tenant_id: &str, name: ChannelName) -> Result<Option<Channel>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT tenant_id, channel, build_id, updated_at
             FROM channels WHERE tenant_id = ?1 AND channel = ?2",
            params![tenant_id, name.as_str()],
            row_to_channel,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_channels(&self, tenant_id: &str) -> Result<Vec<Channel>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT tenant_id, channel, build_id, updated_at
             FROM channels WHERE tenant_id = ?1",
        )?;
        let rows = stmt.query_map(params![tenant_id], row_to_channel)?;

        let mut channels = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        channels.sort_by_key(|c| c.name);
        Ok(channels)
    }

    fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        upsert_channel_row(&self.conn(), channel)?;
        Ok(())
    }

    fn publish_build(&self, build: &Build, channel: Option<&Channel>) -> Result<Build> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT tenant_id FROM builds WHERE id = ?1",
                params![build.id],
                |row| row.get(0),
            )
            .optional()?;
        if owner.is_some_and(|owner| owner != build.tenant_id) {
            // Dropping the transaction rolls it back.
            return Err(Error::Conflict(format!(
                "build id '{}' belongs to another tenant",
                build.id
            )));
        }

        tx.execute(
            "INSERT INTO builds (id, tenant_id, version, commit_hash, artifact_key, artifact_size,
                                 platform_version, loader, loader_version, force_reinstall, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 version = excluded.version,
                 commit_hash = excluded.commit_hash,
                 artifact_key = excluded.artifact_key,
                 artifact_size = excluded.artifact_size,
                 platform_version = excluded.platform_version,
                 loader = excluded.loader,
                 loader_version = excluded.loader_version",
            params![
                build.id,
                build.tenant_id,
                build.version,
                build.commit_hash,
                build.artifact_key,
                build.artifact_size,
                build.metadata.platform_version,
                build.metadata.loader,
                build.metadata.loader_version,
                build.force_reinstall,
                format_datetime(&build.created_at),
            ],
        )?;

        if let Some(channel) = channel {
            upsert_channel_row(&tx, channel)?;
        }

        let stored = tx.query_row(
            &format!("SELECT {BUILD_COLUMNS} FROM builds WHERE id = ?1"),
            params![build.id],
            row_to_build,
        )?;

        tx.commit()?;
        Ok(stored)
    }
}
