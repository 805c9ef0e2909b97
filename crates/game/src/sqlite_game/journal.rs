//! Connection-level inverse-change journal.
//!
//! While a forward step runs, every data change on the connection is
//! recorded as the operation that reverses it: an insert becomes a delete,
//! an update a restore of the old values, a delete a re-insert of the old
//! row. The recorded list serialises into one opaque blob (the undo data
//! the controller stores next to the block) and is replayed in reverse
//! order to rewind the step.
//!
//! Rows are addressed by their SQLite rowid, so game tables must be rowid
//! tables (`WITHOUT ROWID` tables are not seen by the preupdate hook).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{
    Context,
    bail,
};
use parking_lot::Mutex;
use rusqlite::hooks::{
    Action,
    PreUpdateCase,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{
    Connection,
    params,
    params_from_iter,
};
use serde::{
    Deserialize,
    Serialize,
};
use tracing::trace;

/// Tables owned by the engine rather than the game state. Changes to the
/// storage tables happen outside capture windows anyway; the journal must
/// still never record them.
const ENGINE_TABLES: [&str; 3] = ["current", "undo", "xayagame_init"];

/// An SQLite value in serialisable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum JournalValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<SqlValue> for JournalValue {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => JournalValue::Null,
            SqlValue::Integer(i) => JournalValue::Integer(i),
            SqlValue::Real(r) => JournalValue::Real(r),
            SqlValue::Text(s) => JournalValue::Text(s),
            SqlValue::Blob(b) => JournalValue::Blob(b),
        }
    }
}

impl From<&JournalValue> for SqlValue {
    fn from(value: &JournalValue) -> Self {
        match value {
            JournalValue::Null => SqlValue::Null,
            JournalValue::Integer(i) => SqlValue::Integer(*i),
            JournalValue::Real(r) => SqlValue::Real(*r),
            JournalValue::Text(s) => SqlValue::Text(s.clone()),
            JournalValue::Blob(b) => SqlValue::Blob(b.clone()),
        }
    }
}

/// The inverse of one row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum InverseOp {
    /// Undoes an insert.
    Delete { table: String, rowid: i64 },
    /// Undoes an update: `rowid` addresses the row as it is now, `values`
    /// are the full pre-update column values.
    Restore {
        table: String,
        rowid: i64,
        values: Vec<JournalValue>,
    },
    /// Undoes a delete.
    Reinsert {
        table: String,
        rowid: i64,
        values: Vec<JournalValue>,
    },
}

#[derive(Default)]
struct CaptureState {
    ops: Vec<InverseOp>,
    /// First error hit inside the hook; surfaces when capture ends.
    error: Option<String>,
}

/// Recording handle. Dropping it without [`Capture::finish`] leaves the
/// hook installed, so `finish` must run on every path.
pub(crate) struct Capture {
    state: Arc<Mutex<CaptureState>>,
}

impl Capture {
    /// Install the preupdate hook and start recording.
    pub(crate) fn start(conn: &Connection) -> Self {
        let state = Arc::new(Mutex::new(CaptureState::default()));
        let sink = Arc::clone(&state);

        conn.preupdate_hook(Some(
            move |_action: Action, _db: &str, table: &str, case: &PreUpdateCase| {
                if table.starts_with("sqlite_") || ENGINE_TABLES.contains(&table) {
                    return;
                }
                let mut state = sink.lock();
                if state.error.is_some() {
                    return;
                }
                match record_inverse(table, case) {
                    Ok(Some(op)) => state.ops.push(op),
                    Ok(None) => {}
                    Err(err) => state.error = Some(err.to_string()),
                }
            },
        ));

        Self { state }
    }

    /// Remove the hook and serialise the recorded journal.
    pub(crate) fn finish(self, conn: &Connection) -> anyhow::Result<Vec<u8>> {
        conn.preupdate_hook(None::<fn(Action, &str, &str, &PreUpdateCase)>);
        let state = self.state.lock();
        if let Some(error) = &state.error {
            bail!("change capture failed: {error}");
        }
        trace!(ops = state.ops.len(), "captured inverse changeset");
        serde_json::to_vec(&state.ops).context("serialising inverse changeset")
    }

    /// Remove the hook and drop whatever was recorded.
    pub(crate) fn abort(self, conn: &Connection) {
        conn.preupdate_hook(None::<fn(Action, &str, &str, &PreUpdateCase)>);
    }
}

/// Build the inverse of one preupdate notification.
fn record_inverse(table: &str, case: &PreUpdateCase) -> anyhow::Result<Option<InverseOp>> {
    let op = match case {
        PreUpdateCase::Insert(accessor) => InverseOp::Delete {
            table: table.to_string(),
            rowid: accessor.get_new_row_id(),
        },
        PreUpdateCase::Delete(accessor) => {
            let count = accessor.get_column_count();
            let mut values = Vec::with_capacity(count as usize);
            for i in 0..count {
                let value = accessor
                    .get_old_column_value(i)
                    .with_context(|| format!("reading old column {i} of '{table}'"))?;
                values.push(JournalValue::from(SqlValue::from(value)));
            }
            InverseOp::Reinsert {
                table: table.to_string(),
                rowid: accessor.get_old_row_id(),
                values,
            }
        }
        PreUpdateCase::Update {
            old_value_accessor,
            new_value_accessor,
        } => {
            let count = old_value_accessor.get_column_count();
            let mut values = Vec::with_capacity(count as usize);
            for i in 0..count {
                let value = old_value_accessor
                    .get_old_column_value(i)
                    .with_context(|| format!("reading old column {i} of '{table}'"))?;
                values.push(JournalValue::from(SqlValue::from(value)));
            }
            InverseOp::Restore {
                table: table.to_string(),
                // Address the row as it exists after the update; restoring
                // the values also restores a rowid-aliased primary key.
                rowid: new_value_accessor.get_new_row_id(),
                values,
            }
        }
        PreUpdateCase::Unknown => return Ok(None),
    };
    Ok(Some(op))
}

/// Per-table layout needed to rebuild rows.
struct TableInfo {
    columns: Vec<String>,
    /// Whether the table has an `INTEGER PRIMARY KEY` column aliasing the
    /// rowid. If so, re-inserts must not name the rowid explicitly.
    rowid_alias: bool,
}

fn table_info(conn: &Connection, table: &str) -> anyhow::Result<TableInfo> {
    let mut stmt = conn.prepare("SELECT name, type, pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let mut columns = Vec::new();
    let mut pk_columns = 0u32;
    let mut single_integer_pk = false;

    let rows = stmt.query_map(params![table], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
        ))
    })?;
    for row in rows {
        let (name, column_type, pk) = row?;
        if pk > 0 {
            pk_columns += 1;
            single_integer_pk = column_type.eq_ignore_ascii_case("integer");
        }
        columns.push(name);
    }

    if columns.is_empty() {
        bail!("unknown table '{table}' in undo journal");
    }
    Ok(TableInfo {
        columns,
        rowid_alias: pk_columns == 1 && single_integer_pk,
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Replay a serialised journal, last change first.
pub(crate) fn apply_inverse(conn: &Connection, undo: &[u8]) -> anyhow::Result<()> {
    let ops: Vec<InverseOp> =
        serde_json::from_slice(undo).context("deserialising inverse changeset")?;
    let mut infos: HashMap<String, TableInfo> = HashMap::new();

    for op in ops.iter().rev() {
        match op {
            InverseOp::Delete { table, rowid } => {
                conn.execute(
                    &format!("DELETE FROM {} WHERE rowid = ?1", quote_ident(table)),
                    params![rowid],
                )?;
            }
            InverseOp::Restore {
                table,
                rowid,
                values,
            } => {
                let info = lookup(conn, &mut infos, table)?;
                if info.columns.len() != values.len() {
                    bail!(
                        "undo journal for '{table}' has {} values but the table has {} columns",
                        values.len(),
                        info.columns.len()
                    );
                }
                let assignments = info
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 2))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE {} SET {assignments} WHERE rowid = ?1",
                    quote_ident(table)
                );
                let mut bind: Vec<SqlValue> = vec![SqlValue::Integer(*rowid)];
                bind.extend(values.iter().map(SqlValue::from));
                conn.execute(&sql, params_from_iter(bind))?;
            }
            InverseOp::Reinsert {
                table,
                rowid,
                values,
            } => {
                let info = lookup(conn, &mut infos, table)?;
                if info.columns.len() != values.len() {
                    bail!(
                        "undo journal for '{table}' has {} values but the table has {} columns",
                        values.len(),
                        info.columns.len()
                    );
                }
                let mut columns: Vec<String> = Vec::new();
                let mut bind: Vec<SqlValue> = Vec::new();
                if !info.rowid_alias {
                    columns.push("rowid".to_string());
                    bind.push(SqlValue::Integer(*rowid));
                }
                columns.extend(info.columns.iter().map(|c| quote_ident(c)));
                bind.extend(values.iter().map(SqlValue::from));

                let placeholders = (1..=bind.len())
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({placeholders})",
                    quote_ident(table),
                    columns.join(", ")
                );
                conn.execute(&sql, params_from_iter(bind))?;
            }
        }
    }
    Ok(())
}

fn lookup<'a>(
    conn: &Connection,
    infos: &'a mut HashMap<String, TableInfo>,
    table: &str,
) -> anyhow::Result<&'a TableInfo> {
    if !infos.contains_key(table) {
        infos.insert(table.to_string(), table_info(conn, table)?);
    }
    Ok(&infos[table])
}
