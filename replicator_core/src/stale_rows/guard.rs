use std::future::Future;
use std::sync::Arc;

use crate::store::traits::RowStore;
use crate::Result;

/// Autovacuum disabled on one table until released.
///
/// `release` restores it explicitly; dropping the guard unreleased (a cancelled
/// future, a panic unwinding through the caller) spawns the restore on the
/// current Tokio runtime instead.
pub struct AutovacuumPause {
    store: Arc<dyn RowStore>,
    table: String,
    restored: bool,
}

impl AutovacuumPause {
    #[tracing::instrument(level = "debug", skip(store))]
    pub async fn acquire(store: Arc<dyn RowStore>, table: &str) -> Result<Self> {
        store.set_autovacuum(table, false).await?;
        Ok(Self {
            store,
            table: table.to_string(),
            restored: false,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    #[tracing::instrument(level = "debug", skip(self), fields(table = %self.table))]
    pub async fn release(mut self) -> Result<()> {
        let result = self.store.set_autovacuum(&self.table, true).await;
        self.restored = true;
        result
    }
}

impl Drop for AutovacuumPause {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        let store = self.store.clone();
        let table = std::mem::take(&mut self.table);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.set_autovacuum(&table, true).await {
                        tracing::warn!(error = %err, table = %table, "failed to restore autovacuum");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(table = %table, "autovacuum left disabled: no runtime to restore it");
            }
        }
    }
}

/// Run `body` with autovacuum disabled on `table`, restoring it on every exit
/// path. The body's error wins over a restore error.
pub async fn with_autovacuum_paused<F, Fut, T>(
    store: Arc<dyn RowStore>,
    table: &str,
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let pause = AutovacuumPause::acquire(store, table).await?;
    let outcome = body().await;
    let restored = pause.release().await;
    match (outcome, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(restore_err)) => Err(restore_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(restore_err)) => {
            tracing::warn!(error = %restore_err, table = %table, "failed to restore autovacuum");
            Err(err)
        }
    }
}
