//! Database row readiness probe.

use crate::error::env_var;
use rollout_core::probe::ProbeFailure;
use sqlx::{Connection, PgConnection};
use tracing::debug;

/// Postgres `undefined_table`. A schema that has not been migrated yet is a
/// readiness condition, not a transport problem.
const UNDEFINED_TABLE: &str = "42P01";

/// Quote a plain identifier, keeping an optional `schema.` qualifier.
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn exists_query(table: &str, column: &str) -> String {
    format!(
        "SELECT 1 FROM {} WHERE {}::text = $1 LIMIT 1",
        quote_ident(table),
        quote_ident(column)
    )
}

/// One connection, one lookup.
pub async fn record_exists(
    dsn_env: &str,
    table: &str,
    column: &str,
    value: &str,
) -> std::result::Result<(), ProbeFailure> {
    let dsn = env_var(dsn_env).map_err(|e| ProbeFailure::Transport(e.to_string()))?;
    let mut conn = PgConnection::connect(&dsn)
        .await
        .map_err(|e| ProbeFailure::Transport(e.to_string()))?;
    let found = sqlx::query_scalar::<_, i32>(&exists_query(table, column))
        .bind(value)
        .fetch_optional(&mut conn)
        .await;
    let _ = conn.close().await;
    match found {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(ProbeFailure::NotReady(format!(
            "no row in {table} with {column} = '{value}'"
        ))),
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(UNDEFINED_TABLE) => {
            debug!(table, "table does not exist yet");
            Err(ProbeFailure::NotReady(format!("table {table} does not exist")))
        }
        Err(e) => Err(ProbeFailure::Transport(e.to_string())),
    }
}
