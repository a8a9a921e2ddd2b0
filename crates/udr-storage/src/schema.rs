//! Versioned schema updates tracked in `PRAGMA user_version`.

use std::collections::BTreeMap;

use tracing::{info, warn};
use udr_core::config::{SchemaUpdate, VersionTable};

use crate::{exec, exec_batch, scalar_i64, Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaOutcome {
    pub from: u32,
    pub to: u32,
    pub applied: Vec<u32>,
}

/// Walk declared steps from `user_version + 1` until the first gap.
///
/// Each step commits on its own: the update (when its check returns a
/// positive count) and the version bump share one transaction.
pub async fn ensure_schema(
    store: &Store,
    steps: &BTreeMap<u32, SchemaUpdate>,
) -> Result<SchemaOutcome, StoreError> {
    let from = {
        let mut conn = store.pool().acquire().await?;
        u32::try_from(scalar_i64(&mut conn, "PRAGMA user_version").await?).unwrap_or_default()
    };

    let mut version = from;
    let mut applied = Vec::new();
    while let Some(step) = steps.get(&(version + 1)) {
        let next = version + 1;
        if step.update.trim().is_empty() {
            return Err(StoreError::MissingUpdate(next));
        }

        let mut tx = store.begin().await?;
        let count = scalar_i64(&mut tx, &step.check).await?;
        if count > 0 {
            exec_batch(&mut tx, &step.update).await?;
            applied.push(next);
            info!(step = next, "applied schema update");
        }
        exec_batch(&mut tx, &format!("PRAGMA user_version = {next}")).await?;
        tx.commit().await?;
        version = next;
    }

    if version != from {
        info!(from, to = version, ?applied, "schema version advanced");
    }
    Ok(SchemaOutcome {
        from,
        to: version,
        applied,
    })
}

/// Store the running version in the configured one-row table. Failures are
/// logged only.
pub async fn record_version(store: &Store, table: Option<&VersionTable>, version: &str) {
    let Some(table) = table else {
        return;
    };
    let result = async {
        let mut conn = store.pool().acquire().await?;
        exec_batch(&mut conn, &table.create).await?;
        exec(&mut conn, &table.insert, &[version.into()]).await?;
        Ok::<_, StoreError>(())
    }
    .await;
    if let Err(err) = result {
        warn!(error = %err, "could not record version");
    }
}
