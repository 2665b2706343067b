pub const SCHEMA: &str = r#"
-- Tenants own builds and channels
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    source_repository TEXT,         -- owner/name allowed to publish via federated identity
    public INTEGER NOT NULL DEFAULT 0,
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    global_role TEXT NOT NULL DEFAULT 'user',
    created_at TEXT DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS memberships (
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    access_level TEXT NOT NULL DEFAULT 'production',
    PRIMARY KEY (tenant_id, user_id)
);

-- Session tokens; only the SHA-256 of the raw token is stored
CREATE TABLE IF NOT EXISTS user_tokens (
    token_hash TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS deploy_keys (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    key_hash TEXT NOT NULL,             -- argon2id hash with embedded salt
    key_lookup TEXT NOT NULL,           -- tagged prefix of the raw key
    capability TEXT NOT NULL,
    created_at TEXT DEFAULT (datetime('now')),
    last_used_at TEXT,
    revoked_at TEXT
);

CREATE TABLE IF NOT EXISTS runner_tokens (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    token_prefix TEXT NOT NULL,         -- first 16 chars, not unique
    salt TEXT NOT NULL,
    token_hash TEXT NOT NULL,           -- hex sha256(salt || token)
    created_at TEXT DEFAULT (datetime('now')),
    expires_at TEXT,                    -- NULL = never
    revoked_at TEXT
);

CREATE TABLE IF NOT EXISTS builds (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    commit_hash TEXT,
    artifact_key TEXT NOT NULL,         -- <provider>::<key> or legacy bare key
    artifact_size INTEGER,
    platform_version TEXT,
    loader TEXT,
    loader_version TEXT,
    force_reinstall INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS channels (
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    channel TEXT NOT NULL,
    build_id TEXT REFERENCES builds(id) ON DELETE SET NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(tenant_id, channel)
);

CREATE INDEX IF NOT EXISTS idx_memberships_user ON memberships(user_id);
CREATE INDEX IF NOT EXISTS idx_user_tokens_user ON user_tokens(user_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_deploy_keys_lookup ON deploy_keys(key_lookup);
CREATE INDEX IF NOT EXISTS idx_deploy_keys_tenant ON deploy_keys(tenant_id);
CREATE INDEX IF NOT EXISTS idx_runner_tokens_prefix ON runner_tokens(token_prefix);
CREATE INDEX IF NOT EXISTS idx_runner_tokens_tenant ON runner_tokens(tenant_id);
CREATE INDEX IF NOT EXISTS idx_builds_tenant_created ON builds(tenant_id, created_at);
"#;
