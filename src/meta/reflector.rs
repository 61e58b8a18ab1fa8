//! Schema reflector.
//!
//! Answers metadata queries from two TEMP shadow tables that are rebuilt from the
//! engine catalog on demand. Rebuilds are single-flight: concurrent readers that
//! find the shadows stale wait for one rebuild instead of starting their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{
    classify_type, MetaTable, SchemaRow, ShadowColumnRow, ShadowConstraintRow, TableRow,
};
use crate::config::validate_namespace;
use crate::db::{
    DatabaseSession, ExecuteOptions, ExecuteRequest, ExecuteResult, Row, Session, Value,
};
use crate::error::{Result, SessionError};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "meta";

const LIST_TABLES_SQL: &str = "SELECT name FROM sqlite_master \
     WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
     ORDER BY name";

const TABLE_INFO_SQL: &str = "SELECT cid, name, type, \"notnull\", dflt_value, pk \
     FROM pragma_table_info(?) ORDER BY cid";

const FOREIGN_KEY_LIST_SQL: &str = "SELECT id, seq, \"table\", \"from\", \"to\" \
     FROM pragma_foreign_key_list(?) ORDER BY id, seq";

const LIST_SCHEMAS_SQL: &str = "SELECT name AS schema_name FROM pragma_database_list \
     WHERE name <> 'temp' ORDER BY seq";

/// Cached schema metadata over a session.
pub struct SchemaReflector<S: DatabaseSession = Session> {
    session: Arc<S>,
    namespace: String,
    /// Bumped by every invalidation.
    invalidated_epoch: AtomicU64,
    /// Epoch observed at the start of the last successful rebuild.
    fresh_epoch: AtomicU64,
    refresh_gate: Mutex<()>,
    refresh_count: AtomicU64,
}

impl<S: DatabaseSession> SchemaReflector<S> {
    /// Creates a reflector using the default `meta` namespace. The shadows start stale.
    pub fn new(session: Arc<S>) -> Self {
        Self::build(session, DEFAULT_NAMESPACE.to_string())
    }

    /// Creates a reflector whose shadow tables are prefixed with `namespace`.
    pub fn with_namespace(session: Arc<S>, namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self::build(session, namespace))
    }

    fn build(session: Arc<S>, namespace: String) -> Self {
        Self {
            session,
            namespace,
            invalidated_epoch: AtomicU64::new(1),
            fresh_epoch: AtomicU64::new(0),
            refresh_gate: Mutex::new(()),
            refresh_count: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the column shadow table, quoted.
    pub fn columns_table(&self) -> String {
        format!("\"{}$all_columns\"", self.namespace)
    }

    /// Name of the constraint shadow table, quoted.
    pub fn constraints_table(&self) -> String {
        format!("\"{}$all_constraints\"", self.namespace)
    }

    /// Marks the shadows stale. Call after any DDL; the next read rebuilds them.
    pub fn invalidate(&self) {
        let epoch = self.invalidated_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, namespace = %self.namespace, "Schema metadata invalidated");
    }

    /// True if a read would rebuild the shadows first.
    pub fn needs_refresh(&self) -> bool {
        self.fresh_epoch.load(Ordering::SeqCst) < self.invalidated_epoch.load(Ordering::SeqCst)
    }

    /// Number of completed rebuilds.
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Rebuilds the shadows now, regardless of freshness.
    pub async fn refresh(&self) -> Result<()> {
        self.invalidate();
        self.ensure_fresh().await
    }

    /// Rebuilds the shadows if they are stale.
    ///
    /// At most one rebuild runs at a time. A caller that waited for a running
    /// rebuild re-checks freshness and returns without rebuilding again.
    ///
    /// The rebuild is scoped by a savepoint, so a transaction the caller left open
    /// is neither committed nor rolled back. Shadows rebuilt inside such a
    /// transaction stay stale: they vanish if the caller rolls back.
    pub async fn ensure_fresh(&self) -> Result<()> {
        if !self.needs_refresh() {
            return Ok(());
        }

        let _gate = self.refresh_gate.lock().await;
        if !self.needs_refresh() {
            return Ok(());
        }

        let epoch = self.invalidated_epoch.load(Ordering::SeqCst);
        let started = Instant::now();
        let owns_transaction = !self.session.in_transaction().await?;

        match self.rebuild_in_savepoint(owns_transaction).await {
            Ok(table_count) => {
                if owns_transaction {
                    self.fresh_epoch.fetch_max(epoch, Ordering::SeqCst);
                }
                self.refresh_count.fetch_add(1, Ordering::SeqCst);
                info!(
                    session_id = self.session.session_id(),
                    namespace = %self.namespace,
                    tables = table_count,
                    in_caller_transaction = !owns_transaction,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Schema metadata refreshed"
                );
                Ok(())
            }
            Err(e) => {
                self.discard_rebuild(owns_transaction).await;
                warn!(
                    session_id = self.session.session_id(),
                    namespace = %self.namespace,
                    "Schema metadata refresh failed: {e}"
                );
                if e.is_connection_closed() {
                    Err(e)
                } else {
                    Err(SessionError::refresh(e.to_string()))
                }
            }
        }
    }

    fn savepoint(&self) -> String {
        format!("\"{}_refresh\"", self.namespace)
    }

    async fn rebuild_in_savepoint(&self, owns_transaction: bool) -> Result<usize> {
        let savepoint = self.savepoint();
        self.run(&format!("SAVEPOINT {savepoint}")).await?;
        let table_count = self.rebuild().await?;
        self.run(&format!("RELEASE {savepoint}")).await?;
        if owns_transaction {
            self.session.commit().await?;
        }
        Ok(table_count)
    }

    /// Undoes a failed rebuild. Only the rebuild's own work is discarded.
    async fn discard_rebuild(&self, owns_transaction: bool) {
        let session_id = self.session.session_id();
        if owns_transaction {
            if let Err(e) = self.session.rollback().await {
                warn!(session_id, "Rollback after failed metadata refresh failed: {e}");
            }
            return;
        }

        let savepoint = self.savepoint();
        for sql in [
            format!("ROLLBACK TO {savepoint}"),
            format!("RELEASE {savepoint}"),
        ] {
            if let Err(e) = self.run(&sql).await {
                warn!(session_id, "{sql} after failed metadata refresh failed: {e}");
            }
        }
    }

    /// Options for reads issued on the caller's behalf: an open transaction is left open.
    async fn read_options(&self) -> Result<ExecuteOptions> {
        let in_transaction = self.session.in_transaction().await?;
        Ok(ExecuteOptions::default().with_auto_commit(!in_transaction))
    }

    /// Recreates and refills both shadow tables.
    async fn rebuild(&self) -> Result<usize> {
        let columns_table = self.columns_table();
        let constraints_table = self.constraints_table();

        self.run(&format!(
            "CREATE TEMP TABLE IF NOT EXISTS {columns_table} (
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                column_number INTEGER NOT NULL,
                data_type TEXT,
                data_type_mean TEXT NOT NULL,
                char_length INTEGER,
                data_size INTEGER,
                default_value TEXT,
                is_notnull INTEGER NOT NULL,
                pk INTEGER NOT NULL
            )"
        ))
        .await?;
        self.run(&format!(
            "CREATE TEMP TABLE IF NOT EXISTS {constraints_table} (
                table_name TEXT NOT NULL,
                constraint_name TEXT NOT NULL,
                constraint_type TEXT NOT NULL,
                column_name TEXT NOT NULL,
                foreign_table_name TEXT,
                foreign_column_name TEXT
            )"
        ))
        .await?;
        self.run(&format!("DELETE FROM {columns_table}")).await?;
        self.run(&format!("DELETE FROM {constraints_table}")).await?;

        let tables = self.list_tables(rebuild_options()).await?;

        let insert_column = insert_sql(&columns_table, &ShadowColumnRow::COLUMNS);
        let insert_constraint = insert_sql(&constraints_table, &ShadowConstraintRow::COLUMNS);

        for table in &tables {
            let columns = self.introspect_columns(table, rebuild_options()).await?;
            for (column, _) in &columns {
                self.run_with(&insert_column, column.to_values()).await?;
            }
            for pk in primary_keys_of(table, &columns) {
                self.run_with(&insert_constraint, pk.to_values()).await?;
            }
        }

        for table in &tables {
            for fk in self.introspect_foreign_keys(table, rebuild_options()).await? {
                self.run_with(&insert_constraint, fk.to_values()).await?;
            }
        }

        Ok(tables.len())
    }

    async fn run(&self, sql: &str) -> Result<()> {
        self.run_with(sql, Vec::new()).await
    }

    async fn run_with(&self, sql: &str, values: Vec<Value>) -> Result<()> {
        self.session
            .execute(
                ExecuteRequest::new(sql)
                    .with_values(values)
                    .with_options(rebuild_options()),
            )
            .await?;
        Ok(())
    }

    async fn fetch_rows(
        &self,
        sql: &str,
        values: Vec<Value>,
        options: ExecuteOptions,
    ) -> Result<Vec<Row>> {
        let result = self
            .session
            .execute(
                ExecuteRequest::new(sql)
                    .with_values(values)
                    .with_options(options.with_object_rows().with_cursor(false)),
            )
            .await?;
        result
            .into_rows()
            .ok_or_else(|| SessionError::internal("Expected materialized rows"))
    }

    async fn list_tables(&self, options: ExecuteOptions) -> Result<Vec<String>> {
        self.fetch_rows(LIST_TABLES_SQL, Vec::new(), options)
            .await?
            .iter()
            .map(|row| {
                row.get(&[], "name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| SessionError::internal("Catalog row without a table name"))
            })
            .collect()
    }

    /// Reads the physical columns of `table`, in column order.
    async fn introspect_columns(
        &self,
        table: &str,
        options: ExecuteOptions,
    ) -> Result<Vec<(ShadowColumnRow, i64)>> {
        let rows = self
            .fetch_rows(TABLE_INFO_SQL, vec![table.into()], options)
            .await?;

        rows.iter()
            .map(|row| {
                let int = |name: &str| row.get(&[], name).and_then(Value::as_i64);
                let text = |name: &str| {
                    row.get(&[], name)
                        .filter(|v| !v.is_null())
                        .map(Value::to_display_string)
                };

                let cid = int("cid")
                    .ok_or_else(|| SessionError::internal("Column info without cid"))?;
                let column_name = text("name")
                    .ok_or_else(|| SessionError::internal("Column info without name"))?;
                let declared = text("type").unwrap_or_default();
                let pk_position = int("pk").unwrap_or(0);
                let class = classify_type(&declared);

                let column = ShadowColumnRow {
                    table_name: table.to_string(),
                    column_name,
                    column_number: cid + 1,
                    data_type: class.data_type,
                    data_type_mean: class.mean,
                    char_length: class.char_length,
                    data_size: class.data_size,
                    default_value: text("dflt_value"),
                    is_notnull: int("notnull").unwrap_or(0) != 0,
                    pk: pk_position > 0,
                };
                Ok((column, pk_position))
            })
            .collect()
    }

    /// Reads the foreign-key column mappings of `table`.
    ///
    /// A mapping without a target column refers to the parent's primary key,
    /// which is looked up by position.
    async fn introspect_foreign_keys(
        &self,
        table: &str,
        options: ExecuteOptions,
    ) -> Result<Vec<ShadowConstraintRow>> {
        let rows = self
            .fetch_rows(FOREIGN_KEY_LIST_SQL, vec![table.into()], options)
            .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let int = |name: &str| row.get(&[], name).and_then(Value::as_i64);
            let text = |name: &str| {
                row.get(&[], name)
                    .filter(|v| !v.is_null())
                    .map(Value::to_display_string)
            };

            let id = int("id").ok_or_else(|| SessionError::internal("Foreign key without id"))?;
            let seq = int("seq").unwrap_or(0);
            let parent = text("table")
                .ok_or_else(|| SessionError::internal("Foreign key without parent table"))?;
            let column = text("from")
                .ok_or_else(|| SessionError::internal("Foreign key without column"))?;

            let foreign_column = match text("to") {
                Some(to) => Some(to),
                None => {
                    let parent_columns = self.introspect_columns(&parent, options).await?;
                    primary_keys_of(&parent, &parent_columns)
                        .into_iter()
                        .nth(seq as usize)
                        .map(|pk| pk.column_name)
                }
            };

            keys.push(ShadowConstraintRow::foreign_key(
                table,
                id,
                column,
                parent,
                foreign_column,
            ));
        }
        Ok(keys)
    }

    /// Answers a metadata query in the caller's result shape.
    ///
    /// Everything except `schemas` is served from the shadow tables, which are
    /// rebuilt first if stale. `filter` restricts to one table, case-insensitively.
    pub async fn query(
        &self,
        table: MetaTable,
        filter: Option<&str>,
        options: ExecuteOptions,
    ) -> Result<ExecuteResult> {
        if table.uses_shadow_tables() {
            self.ensure_fresh().await?;
        }

        let (sql, values) = self.meta_sql(table, filter);
        self.session
            .execute(
                ExecuteRequest::new(sql)
                    .with_values(values)
                    .with_options(options),
            )
            .await
    }

    fn meta_sql(&self, table: MetaTable, filter: Option<&str>) -> (String, Vec<Value>) {
        let values: Vec<Value> = filter.map(Value::from).into_iter().collect();
        let by_table = |prefix: &str| match filter {
            Some(_) => format!("{prefix} UPPER(table_name) = UPPER(?)"),
            None => String::new(),
        };

        let sql = match table {
            MetaTable::Schemas => return (LIST_SCHEMAS_SQL.to_string(), Vec::new()),
            MetaTable::Tables => format!(
                "SELECT table_name, COUNT(*) AS column_count FROM {} {} \
                 GROUP BY table_name ORDER BY table_name",
                self.columns_table(),
                by_table("WHERE"),
            ),
            MetaTable::Columns => format!(
                "SELECT {} FROM {} {} ORDER BY table_name, column_number",
                ShadowColumnRow::COLUMNS.join(", "),
                self.columns_table(),
                by_table("WHERE"),
            ),
            MetaTable::PrimaryKeys => format!(
                "SELECT {} FROM {} WHERE constraint_type = 'P' {} \
                 ORDER BY table_name, rowid",
                ShadowConstraintRow::COLUMNS.join(", "),
                self.constraints_table(),
                by_table("AND"),
            ),
            MetaTable::ForeignKeys => format!(
                "SELECT {} FROM {} WHERE constraint_type = 'F' {} \
                 ORDER BY table_name, constraint_name, rowid",
                ShadowConstraintRow::COLUMNS.join(", "),
                self.constraints_table(),
                by_table("AND"),
            ),
        };
        (sql, values)
    }

    async fn query_rows(&self, table: MetaTable, filter: Option<&str>) -> Result<Vec<Row>> {
        let options = self.read_options().await?.with_object_rows();
        self.query(table, filter, options)
            .await?
            .into_rows()
            .ok_or_else(|| SessionError::internal("Expected materialized rows"))
    }

    /// Lists attached databases, excluding `temp`.
    pub async fn query_schemas(&self) -> Result<Vec<SchemaRow>> {
        self.query_rows(MetaTable::Schemas, None)
            .await?
            .iter()
            .map(SchemaRow::from_row)
            .collect()
    }

    /// Lists user tables with their column counts.
    pub async fn query_tables(&self, filter: Option<&str>) -> Result<Vec<TableRow>> {
        self.query_rows(MetaTable::Tables, filter)
            .await?
            .iter()
            .map(TableRow::from_row)
            .collect()
    }

    /// Lists columns, ordered by table then position.
    pub async fn query_columns(&self, filter: Option<&str>) -> Result<Vec<ShadowColumnRow>> {
        self.query_rows(MetaTable::Columns, filter)
            .await?
            .iter()
            .map(ShadowColumnRow::from_row)
            .collect()
    }

    /// Lists primary-key columns in key order.
    pub async fn query_primary_keys(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ShadowConstraintRow>> {
        self.query_rows(MetaTable::PrimaryKeys, filter)
            .await?
            .iter()
            .map(ShadowConstraintRow::from_row)
            .collect()
    }

    /// Lists foreign-key column mappings.
    pub async fn query_foreign_keys(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ShadowConstraintRow>> {
        self.query_rows(MetaTable::ForeignKeys, filter)
            .await?
            .iter()
            .map(ShadowConstraintRow::from_row)
            .collect()
    }

    /// Reads the columns of one table straight from the engine, bypassing the shadows.
    pub async fn get_table_columns(&self, table: &str) -> Result<Vec<ShadowColumnRow>> {
        Ok(self
            .introspect_columns(table, self.read_options().await?)
            .await?
            .into_iter()
            .map(|(column, _)| column)
            .collect())
    }

    /// Reads the primary key of one table straight from the engine.
    pub async fn get_table_primary_key(&self, table: &str) -> Result<Vec<ShadowConstraintRow>> {
        let columns = self
            .introspect_columns(table, self.read_options().await?)
            .await?;
        Ok(primary_keys_of(table, &columns))
    }

    /// Reads the foreign keys of one table straight from the engine.
    pub async fn get_table_foreign_keys(&self, table: &str) -> Result<Vec<ShadowConstraintRow>> {
        self.introspect_foreign_keys(table, self.read_options().await?)
            .await
    }
}

impl<S: DatabaseSession> std::fmt::Debug for SchemaReflector<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaReflector")
            .field("session_id", &self.session.session_id())
            .field("namespace", &self.namespace)
            .field("needs_refresh", &self.needs_refresh())
            .field("refresh_count", &self.refresh_count())
            .finish()
    }
}

/// Statements of a rebuild never commit; the rebuild decides at the end.
fn rebuild_options() -> ExecuteOptions {
    ExecuteOptions::default().with_auto_commit(false)
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

/// Primary-key rows of `table` in key order.
fn primary_keys_of(table: &str, columns: &[(ShadowColumnRow, i64)]) -> Vec<ShadowConstraintRow> {
    let mut keyed: Vec<&(ShadowColumnRow, i64)> =
        columns.iter().filter(|(_, position)| *position > 0).collect();
    keyed.sort_by_key(|(_, position)| *position);
    keyed
        .into_iter()
        .map(|(column, _)| ShadowConstraintRow::primary_key(table, column.column_name.clone()))
        .collect()
}
