//! Postgres pool setup and schema application.

use log::info;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Statements applied idempotently at boot. Column names are load-bearing:
/// admin tooling and the session layer address them directly.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS flat_requests (
        id BIGSERIAL PRIMARY KEY,
        flat_id TEXT NOT NULL,
        name TEXT NOT NULL,
        note TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'PENDING',
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_flat_requests_status ON flat_requests (status)",
    r#"
    CREATE TABLE IF NOT EXISTS flats (
        flat_id TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'ACTIVE',
        pin_hash TEXT,
        password_hash TEXT,
        strike_count INTEGER NOT NULL DEFAULT 0,
        ban_until TIMESTAMPTZ,
        requires_admin_revoke BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        last_login_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS setup_codes (
        id BIGSERIAL PRIMARY KEY,
        flat_id TEXT NOT NULL REFERENCES flats (flat_id),
        code_hash TEXT NOT NULL,
        expires_at BIGINT NOT NULL,
        used_at BIGINT,
        created_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_setup_codes_flat_id ON setup_codes (flat_id)",
    "CREATE INDEX IF NOT EXISTS idx_setup_codes_expires_at ON setup_codes (expires_at)",
    r#"
    CREATE TABLE IF NOT EXISTS admin_audit (
        id BIGSERIAL PRIMARY KEY,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        target TEXT,
        detail TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_sessions (
        sid TEXT PRIMARY KEY,
        sess JSONB NOT NULL,
        expire TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_user_sessions_expire ON user_sessions (expire)",
];

/// Connect to Postgres with a small shared pool.
pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await
}

/// Apply the schema. Every statement is `IF NOT EXISTS`, so reruns are free.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("database schema verified ({} statements)", SCHEMA.len());
    Ok(())
}
