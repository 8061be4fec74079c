use anyhow::Result;
use sqlx::PgPool;

/// Initialize the Postgres schema (ledger + cold store).
///
/// Idempotent; runs at startup before any worker consumes a job.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing Postgres schema...");

    for statement in [
        CREATE_ACCOUNTS_TABLE,
        CREATE_LEDGER_ENTRIES_TABLE,
        CREATE_LEDGER_SETTLEMENT_UNIQ,
        CREATE_LEDGER_ACCOUNT_IDX,
        CREATE_TABLES_TABLE,
        CREATE_HAND_HISTORIES_TABLE,
        CREATE_HAND_HISTORIES_IDX,
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("schema statement failed: {}", e))?;
    }

    tracing::info!("Postgres schema initialized successfully");
    Ok(())
}

const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    currency TEXT NOT NULL,
    account_type TEXT NOT NULL,
    balance BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (user_id, currency, account_type)
)
"#;

const CREATE_LEDGER_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    id BIGSERIAL PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts(id),
    amount BIGINT NOT NULL,
    kind TEXT NOT NULL,
    reference_id TEXT,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

// Settlement postings are replay-safe through this partial unique index.
const CREATE_LEDGER_SETTLEMENT_UNIQ: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ledger_entries_settlement_uniq
    ON ledger_entries (account_id, reference_id, kind)
    WHERE kind IN ('HAND_WIN', 'HAND_LOSS', 'RAKE') AND reference_id IS NOT NULL
"#;

const CREATE_LEDGER_ACCOUNT_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS ledger_entries_account_idx
    ON ledger_entries (account_id, id)
"#;

const CREATE_TABLES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tables (
    id TEXT PRIMARY KEY,
    config JSONB NOT NULL,
    state JSONB NOT NULL,
    status TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_HAND_HISTORIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS hand_histories (
    id BIGSERIAL PRIMARY KEY,
    table_id TEXT NOT NULL,
    hand_id BIGINT NOT NULL,
    data JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const CREATE_HAND_HISTORIES_IDX: &str = r#"
CREATE INDEX IF NOT EXISTS hand_histories_table_idx
    ON hand_histories (table_id, id)
"#;
