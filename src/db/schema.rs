//! PostgreSQL schema bootstrap
//!
//! Every statement is idempotent so `init_schema` can run on each startup.

use anyhow::Result;
use sqlx::PgPool;

pub async fn init_schema(pool: &PgPool) -> Result<()> {
    tracing::info!("Initializing ledger schema...");

    for (name, ddl) in [
        ("accounts", CREATE_ACCOUNTS_TABLE),
        ("journal_entries", CREATE_JOURNAL_ENTRIES_TABLE),
        ("postings", CREATE_POSTINGS_TABLE),
        ("postings index", CREATE_POSTINGS_ACCOUNT_INDEX),
        ("transfers", CREATE_TRANSFERS_TABLE),
        ("transfers index", CREATE_TRANSFERS_STALE_INDEX),
        ("idempotency_keys", CREATE_IDEMPOTENCY_KEYS_TABLE),
    ] {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", name, e))?;
    }

    tracing::info!("Ledger schema ready");
    Ok(())
}

/// Balance and version are only ever changed together by the journal engine
const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id                VARCHAR(26) PRIMARY KEY,
    owner_id          BIGINT      NOT NULL,
    currency          VARCHAR(12) NOT NULL,
    status            SMALLINT    NOT NULL DEFAULT 1,
    version           BIGINT      NOT NULL DEFAULT 0,
    cached_balance    BIGINT      NOT NULL DEFAULT 0,
    overdraft_allowed BOOLEAN     NOT NULL DEFAULT FALSE,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CHECK (overdraft_allowed OR cached_balance >= 0)
)
"#;

const CREATE_JOURNAL_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS journal_entries (
    id             VARCHAR(26)  PRIMARY KEY,
    reference_id   VARCHAR(128) NOT NULL UNIQUE,
    status         SMALLINT     NOT NULL,
    failure_reason TEXT,
    created_at     TIMESTAMPTZ  NOT NULL DEFAULT NOW()
)
"#;

const CREATE_POSTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS postings (
    id               VARCHAR(26) PRIMARY KEY,
    journal_entry_id VARCHAR(26) NOT NULL REFERENCES journal_entries(id),
    seq              SMALLINT    NOT NULL,
    account_id       VARCHAR(26) NOT NULL REFERENCES accounts(id),
    amount           BIGINT      NOT NULL CHECK (amount <> 0),
    direction        SMALLINT    NOT NULL,
    UNIQUE (journal_entry_id, seq)
)
"#;

const CREATE_POSTINGS_ACCOUNT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_postings_account ON postings (account_id)";

const CREATE_TRANSFERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfers (
    id                  VARCHAR(26)  PRIMARY KEY,
    caller_id           BIGINT       NOT NULL,
    idempotency_key     VARCHAR(128) NOT NULL,
    request_hash        VARCHAR(32)  NOT NULL,
    source_account      VARCHAR(26)  NOT NULL,
    destination_account VARCHAR(26)  NOT NULL,
    amount              BIGINT       NOT NULL CHECK (amount > 0),
    currency            VARCHAR(12)  NOT NULL,
    description         TEXT,
    state               SMALLINT     NOT NULL,
    failure_reason      TEXT,
    created_at          TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    updated_at          TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    UNIQUE (caller_id, idempotency_key)
)
"#;

const CREATE_TRANSFERS_STALE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_transfers_state_updated ON transfers (state, updated_at)";

const CREATE_IDEMPOTENCY_KEYS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    caller_id       BIGINT       NOT NULL,
    idem_key        VARCHAR(128) NOT NULL,
    request_hash    VARCHAR(32)  NOT NULL,
    state           SMALLINT     NOT NULL,
    response_status SMALLINT,
    response_body   TEXT,
    locked_until    TIMESTAMPTZ,
    expires_at      TIMESTAMPTZ  NOT NULL,
    created_at      TIMESTAMPTZ  NOT NULL DEFAULT NOW(),
    PRIMARY KEY (caller_id, idem_key)
)
"#;
