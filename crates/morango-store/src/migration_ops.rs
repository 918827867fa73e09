//! Schema versioning.
//!
//! There is exactly one schema version so far; the version check exists so
//! that a future additive migration (e.g. the `last_transfer_session_id`
//! column the spec calls out) has somewhere to hook in without a rewrite.

use tracing::{debug, info};

use crate::{
    buffer, database_id, database_max_counter, db_version, deleted_models, hard_deleted_models,
    instance_id, record_max_counter, record_max_counter_buffer, store, sync_session,
    transfer_session, Database, DbResult, DbVersionTooHighSnafu, WriteTransactionCtx,
};

impl Database {
    pub(crate) fn init_tables_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        tx.open_table(&db_version::TABLE)?;
        tx.open_table(&database_id::TABLE)?;
        tx.open_table(&instance_id::TABLE)?;

        tx.open_table(&store::TABLE)?;
        tx.open_table(&record_max_counter::TABLE)?;

        tx.open_table(&buffer::TABLE)?;
        tx.open_table(&record_max_counter_buffer::TABLE)?;

        tx.open_table(&database_max_counter::TABLE)?;

        tx.open_table(&deleted_models::TABLE)?;
        tx.open_table(&hard_deleted_models::TABLE)?;

        tx.open_table(&sync_session::TABLE)?;
        tx.open_table(&transfer_session::TABLE)?;
        Ok(())
    }

    pub(crate) fn handle_db_ver_migrations(dbtx: &WriteTransactionCtx) -> DbResult<()> {
        /// Current schema version. Bump when a schema change needs a
        /// migration step below.
        const DB_VER: u64 = 1;

        let mut table_db_ver = dbtx.open_table(&db_version::TABLE)?;

        let Some(cur_db_ver) = table_db_ver.first()?.map(|g| g.1.value()) else {
            info!(target: crate::LOG_TARGET, "initializing new database");
            table_db_ver.insert(&(), &DB_VER)?;
            return Ok(());
        };

        if DB_VER < cur_db_ver {
            return DbVersionTooHighSnafu {
                db_ver: cur_db_ver,
                code_ver: DB_VER,
            }
            .fail();
        }

        if cur_db_ver == DB_VER {
            debug!(target: crate::LOG_TARGET, db_ver = DB_VER, "database version up to date");
            return Ok(());
        }

        // Future incremental migrations go here, e.g.:
        // if cur_db_ver < 2 {
        //     Self::migrate_v1_to_v2(dbtx)?;
        // }

        drop(table_db_ver);
        let mut table_db_ver = dbtx.open_table(&db_version::TABLE)?;
        table_db_ver.insert(&(), &DB_VER)?;
        Ok(())
    }
}
