//! Postgres schema for the job ledger and the blob storage engine.
//!
//! Table names are unqualified so that an install can be isolated by pointing
//! the connection's `search_path` at a dedicated schema.

use sqlx::PgPool;
use tracing::{info, instrument};

use jobvault_core::{JobError, JobResult};

use crate::jobs::map_sqlx_error;

/// Advisory lock key held while the schema is installed, so that processes
/// starting together do not race on `CREATE ... IF NOT EXISTS`.
const SCHEMA_LOCK_KEY: i64 = 0x6a76_7363_6865_6d61;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "job_type",
        r#"
        CREATE TABLE IF NOT EXISTS job_type (
            id      BIGSERIAL PRIMARY KEY,
            code    VARCHAR(255) NOT NULL UNIQUE
        )
        "#,
    ),
    (
        "job_data_media_type",
        r#"
        CREATE TABLE IF NOT EXISTS job_data_media_type (
            id      BIGSERIAL PRIMARY KEY,
            code    VARCHAR(255) NOT NULL UNIQUE
        )
        "#,
    ),
    (
        "job_data_encoding",
        r#"
        CREATE TABLE IF NOT EXISTS job_data_encoding (
            id      BIGSERIAL PRIMARY KEY,
            code    VARCHAR(32) NOT NULL UNIQUE
        )
        "#,
    ),
    (
        "job_data_encoding_seed",
        r#"
        INSERT INTO job_data_encoding (code)
        VALUES ('none'), ('gzip')
        ON CONFLICT (code) DO NOTHING
        "#,
    ),
    (
        "job_assignment",
        r#"
        CREATE TABLE IF NOT EXISTS job_assignment (
            id      BIGSERIAL PRIMARY KEY,
            code    UUID NOT NULL UNIQUE
        )
        "#,
    ),
    (
        "job",
        r#"
        CREATE TABLE IF NOT EXISTS job (
            id                  BIGSERIAL PRIMARY KEY,
            code                UUID NOT NULL UNIQUE REFERENCES job_assignment (code),
            job_type_id         BIGINT NOT NULL REFERENCES job_type (id),
            owner               VARCHAR(255) NULL,
            specification       JSONB NOT NULL,
            progress_percent    INTEGER NOT NULL DEFAULT 0
                                CHECK (progress_percent BETWEEN 0 AND 100),
            queue_timestamp     TIMESTAMPTZ NULL,
            start_timestamp     TIMESTAMPTZ NULL,
            finish_timestamp    TIMESTAMPTZ NULL,
            fail_timestamp      TIMESTAMPTZ NULL,
            cancel_timestamp    TIMESTAMPTZ NULL,
            expiry_timestamp    TIMESTAMPTZ NOT NULL,
            create_timestamp    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            modify_timestamp    TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "job_idx_type_queue",
        "CREATE INDEX IF NOT EXISTS job_idx_type_queue ON job (job_type_id, queue_timestamp DESC)",
    ),
    (
        "job_idx_owner",
        "CREATE INDEX IF NOT EXISTS job_idx_owner ON job (owner, queue_timestamp DESC)",
    ),
    (
        "job_idx_expiry",
        "CREATE INDEX IF NOT EXISTS job_idx_expiry ON job (expiry_timestamp)",
    ),
    (
        "job_data",
        r#"
        CREATE TABLE IF NOT EXISTS job_data (
            id                  BIGSERIAL PRIMARY KEY,
            code                UUID NOT NULL UNIQUE,
            job_id              BIGINT NULL REFERENCES job (id),
            role                VARCHAR(32) NOT NULL
                                CHECK (role IN ('SUPPLIED', 'GENERATED')),
            use_code            VARCHAR(255) NULL,
            media_type_id       BIGINT NOT NULL REFERENCES job_data_media_type (id),
            encoding_id         BIGINT NOT NULL REFERENCES job_data_encoding (id),
            storage_code        VARCHAR(255) NOT NULL,
            create_timestamp    TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "job_data_idx_job",
        "CREATE INDEX IF NOT EXISTS job_data_idx_job ON job_data (job_id, role)",
    ),
    (
        "job_data_idx_storage_code",
        "CREATE INDEX IF NOT EXISTS job_data_idx_storage_code ON job_data (storage_code)",
    ),
    (
        "object_head",
        r#"
        CREATE TABLE IF NOT EXISTS object_head (
            id                  BIGSERIAL PRIMARY KEY,
            code                VARCHAR(255) NOT NULL UNIQUE,
            length              BIGINT NOT NULL DEFAULT 0 CHECK (length >= 0),
            create_timestamp    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            modify_timestamp    TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "object_part_ordering_seq",
        "CREATE SEQUENCE IF NOT EXISTS object_part_ordering_seq",
    ),
    (
        "object_part",
        r#"
        CREATE TABLE IF NOT EXISTS object_part (
            id                  BIGSERIAL PRIMARY KEY,
            object_head_id      BIGINT NOT NULL REFERENCES object_head (id),
            ordering            BIGINT NOT NULL DEFAULT nextval('object_part_ordering_seq'),
            length              BIGINT NOT NULL CHECK (length >= 0),
            data                BYTEA NOT NULL
        )
        "#,
    ),
    (
        "object_part_idx_head",
        "CREATE INDEX IF NOT EXISTS object_part_idx_head ON object_part (object_head_id, ordering)",
    ),
];

/// Install every table, index and sequence that is missing.
///
/// Idempotent; safe to call from each process at startup.
#[instrument(skip(pool), err)]
pub async fn ensure_schema(pool: &PgPool) -> JobResult<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("schema_lock", e))?;

    for (name, sql) in STATEMENTS {
        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| match map_sqlx_error("ensure_schema", e) {
                JobError::Storage(msg) => JobError::storage(format!("{name}: {msg}")),
                other => other,
            })?;
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))?;

    info!(statements = STATEMENTS.len(), "job vault schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_are_idempotent_ddl() {
        for (name, sql) in STATEMENTS {
            let sql = sql.trim_start();
            assert!(
                sql.contains("IF NOT EXISTS") || sql.contains("ON CONFLICT"),
                "{name} must be safe to re-run"
            );
            assert!(!sql.contains("public."), "{name} must not pin a schema");
        }
    }

    #[test]
    fn referenced_tables_are_created_first() {
        let position = |table: &str| {
            STATEMENTS
                .iter()
                .position(|(name, _)| *name == table)
                .unwrap()
        };
        assert!(position("job_assignment") < position("job"));
        assert!(position("job") < position("job_data"));
        assert!(position("object_part_ordering_seq") < position("object_part"));
        assert!(position("object_head") < position("object_part"));
    }
}
