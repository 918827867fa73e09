//! Durable storage for the morango sync engine: the `Store`/`RecordMaxCounter`
//! tables, their `Buffer`/`RecordMaxCounterBuffer` wire-staging mirrors, the
//! `DatabaseMaxCounter` summary, and the session bookkeeping tables - plus the
//! transactional operations (queue, dequeue, FSIC delta, instance/counter
//! registry) that only ever touch those tables and never the application
//! schema.
//!
//! Serializer and Deserializer (which *do* need the application schema) live
//! one layer up, in `morango-sync`.

pub mod dequeue_ops;
pub mod fsic_ops;
mod instance_ops;
mod migration_ops;
pub mod queue_ops;
pub mod session_ops;
pub mod tables;

#[cfg(test)]
mod tests;

use std::io;
use std::ops;
use std::path::{Path, PathBuf};

use redb_bincode::{ReadTransaction, WriteTransaction};
use snafu::{Location, ResultExt as _, Snafu};
use tokio::task::JoinError;

pub use self::tables::*;

const LOG_TARGET: &str = "morango::store";

/// A write transaction with deferred, post-commit side effects.
///
/// Mirrors the pattern every stage relies on: all per-record state changes
/// for one stage (queue, dequeue, serialize) happen inside a single redb
/// write transaction, and anything that should only become visible once that
/// transaction actually lands (a log line, a notification) is registered via
/// [`WriteTransactionCtx::on_commit`] instead of being run eagerly.
pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    on_commit: std::sync::Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: std::sync::Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;

        dbtx.commit()?;

        for hook in on_commit.lock().expect("locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    /// Persistent instance identity could not be read or written.
    #[snafu(visibility(pub))]
    IdentityUnavailable {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    /// Post-dequeue self-check (S1/S2, or Buffer-residue check P3) failed.
    #[snafu(visibility(pub))]
    MergeInvariantViolated {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    Overflow,
}
pub type DbResult<T> = std::result::Result<T, DbError>;

#[derive(Debug)]
pub struct Database {
    inner: redb_bincode::Database,
    self_instance_id: std::sync::Mutex<Option<morango_core::InstanceId>>,
}

impl Database {
    pub async fn new_in_memory() -> DbResult<Database> {
        tracing::debug!(target: LOG_TARGET, "opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> DbResult<Database> {
        let path = path.into();
        tracing::debug!(target: LOG_TARGET, path = %path.display(), "opening database");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> DbResult<Database> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Self::handle_db_ver_migrations(tx)
        })
        .await?;

        Ok(Self {
            inner,
            self_instance_id: std::sync::Mutex::new(None),
        })
    }

    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    pub async fn read_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_read().context(TransactionSnafu)?;
            f(&dbtx)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::read_with_inner(&self.inner, f).await
    }

    pub async fn mk_db_path(data_dir: &Path, name: &str) -> Result<PathBuf, io::Error> {
        tokio::fs::create_dir_all(&data_dir).await?;
        Ok(data_dir.join(format!("{name}.morango.redb")))
    }
}
