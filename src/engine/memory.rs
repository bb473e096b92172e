//! In-memory engine: base tables in a shared catalog, temporary tables per
//! session, copy-on-write undo images per statement, savepoint and
//! transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use super::locks::{LockKey, LockTable};
use super::{Engine, EngineSession, ExecContext, ExecOutcome, RollbackReport};
use crate::core::{ServerError, Value};
use crate::network::response::{Column, ResultSet};
use crate::parser::{
    AlterTableOp, CreateTableParams, Expr, Filter, HandlerRead, InsertParams, SelectParams,
    StatementDescriptor, StatementKind, StatementParams, TableRef, UpdateParams,
};
use crate::session::Warning;

/// Rows scanned between two kill checks.
const KILL_CHECK_INTERVAL: usize = 256;

const NON_TRANSACTIONAL_ENGINES: [&str; 3] = ["MEMORY", "MYISAM", "HEAP"];

#[derive(Debug, Clone, Default)]
struct TableData {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    indexes: Vec<String>,
    transactional: bool,
}

impl TableData {
    fn new(columns: Vec<String>, engine: Option<&str>) -> Self {
        let transactional = !engine.is_some_and(|e| NON_TRANSACTIONAL_ENGINES.contains(&e));
        Self {
            columns,
            rows: Vec::new(),
            indexes: Vec::new(),
            transactional,
        }
    }

    fn column_index(&self, name: &str, table: &str) -> Result<usize, ServerError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ServerError::BadField {
                column: name.to_string(),
                table: table.to_string(),
            })
    }

    fn matches(&self, row: &[Value], filter: Option<&Filter>, idx: Option<usize>) -> bool {
        match (filter, idx) {
            (Some(f), Some(i)) => row[i].sql_eq(&f.value),
            _ => true,
        }
    }
}

#[derive(Debug, Default)]
struct Catalog {
    databases: BTreeMap<String, BTreeMap<String, TableData>>,
}

#[derive(Debug, Default)]
struct Shared {
    catalog: RwLock<Catalog>,
    locks: LockTable,
}

impl Shared {
    fn read(&self) -> Result<RwLockReadGuard<'_, Catalog>, ServerError> {
        self.catalog
            .read()
            .map_err(|_| ServerError::Internal("catalog poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Catalog>, ServerError> {
        self.catalog
            .write()
            .map_err(|_| ServerError::Internal("catalog poisoned".into()))
    }
}

/// In-process storage engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with the given databases already created.
    #[must_use]
    pub fn with_databases(names: &[&str]) -> Self {
        let engine = Self::new();
        if let Ok(mut catalog) = engine.shared.write() {
            for name in names {
                catalog.databases.entry(name.to_lowercase()).or_default();
            }
        }
        engine
    }

    /// Row count of a base table, for tests and SHOW output.
    #[must_use]
    pub fn row_count(&self, db: &str, table: &str) -> Option<usize> {
        let catalog = self.shared.read().ok()?;
        catalog.databases.get(db)?.get(table).map(|t| t.rows.len())
    }
}

impl Engine for MemoryEngine {
    fn name(&self) -> &'static str {
        "InnoDB"
    }

    fn databases(&self) -> Vec<String> {
        self.shared
            .read()
            .map(|c| c.databases.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn database_exists(&self, db: &str) -> bool {
        self.shared
            .read()
            .is_ok_and(|c| c.databases.contains_key(db))
    }

    fn tables(&self, db: &str) -> Result<Vec<String>, ServerError> {
        let catalog = self.shared.read()?;
        catalog
            .databases
            .get(db)
            .map(|tables| tables.keys().cloned().collect())
            .ok_or_else(|| ServerError::UnknownDatabase(db.to_string()))
    }

    fn table_exists(&self, db: &str, table: &str) -> bool {
        self.shared
            .read()
            .is_ok_and(|c| c.databases.get(db).is_some_and(|t| t.contains_key(table)))
    }

    fn columns(&self, db: &str, table: &str) -> Result<Vec<String>, ServerError> {
        let catalog = self.shared.read()?;
        catalog
            .databases
            .get(db)
            .and_then(|t| t.get(table))
            .map(|t| t.columns.clone())
            .ok_or_else(|| ServerError::NoSuchTable {
                db: db.to_string(),
                table: table.to_string(),
            })
    }

    fn open_session(&self, session_id: u32) -> Box<dyn EngineSession> {
        Box::new(MemorySession::new(session_id, Arc::clone(&self.shared)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TableKey {
    db: String,
    name: String,
    temporary: bool,
}

/// Table images captured before the first change inside one undo level.
#[derive(Debug, Default)]
struct UndoLevel {
    name: Option<String>,
    images: HashMap<TableKey, TableData>,
    unsafe_tables: bool,
}

struct MemorySession {
    id: u32,
    shared: Arc<Shared>,
    temporary: BTreeMap<(String, String), TableData>,
    transaction: Option<UndoLevel>,
    savepoints: Vec<UndoLevel>,
    statement: Option<UndoLevel>,
    holds_locks: bool,
    rollback_requested: bool,
}

impl MemorySession {
    fn new(id: u32, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            temporary: BTreeMap::new(),
            transaction: None,
            savepoints: Vec::new(),
            statement: None,
            holds_locks: false,
            rollback_requested: false,
        }
    }

    fn key(&self, db: &str, name: &str) -> TableKey {
        TableKey {
            db: db.to_string(),
            name: name.to_string(),
            temporary: self.temporary.contains_key(&(db.to_string(), name.to_string())),
        }
    }

    fn levels_mut(&mut self) -> impl Iterator<Item = &mut UndoLevel> {
        self.transaction
            .iter_mut()
            .chain(self.savepoints.iter_mut())
            .chain(self.statement.iter_mut())
    }

    /// Records the current image of `key` in every open level that does not
    /// have one yet. Non-transactional tables only mark the levels unsafe.
    fn capture(&mut self, key: &TableKey) -> Result<(), ServerError> {
        let (image, transactional) = {
            let catalog = self.shared.read()?;
            let table = if key.temporary {
                self.temporary.get(&(key.db.clone(), key.name.clone()))
            } else {
                catalog.databases.get(&key.db).and_then(|t| t.get(&key.name))
            };
            match table {
                Some(t) if t.transactional => (Some(t.clone()), true),
                Some(_) => (None, false),
                None => return Ok(()),
            }
        };
        for level in self.levels_mut() {
            if !transactional {
                level.unsafe_tables = true;
            } else if !level.images.contains_key(key) {
                if let Some(image) = &image {
                    level.images.insert(key.clone(), image.clone());
                }
            }
        }
        Ok(())
    }

    fn restore(&mut self, level: UndoLevel) -> RollbackReport {
        if !level.images.is_empty() {
            match self.shared.write() {
                Ok(mut catalog) => {
                    for (key, image) in level.images {
                        if key.temporary {
                            self.temporary.insert((key.db, key.name), image);
                        } else if let Some(tables) = catalog.databases.get_mut(&key.db) {
                            tables.insert(key.name, image);
                        }
                    }
                }
                Err(err) => warn!(session = self.id, %err, "rollback could not restore tables"),
            }
        }
        RollbackReport {
            unsafe_tables: level.unsafe_tables,
        }
    }

    fn ensure_transaction(&mut self) {
        if self.transaction.is_none() {
            self.transaction = Some(UndoLevel::default());
        }
        if self.statement.is_none() {
            self.statement = Some(UndoLevel::default());
        }
    }

    fn release_locks(&mut self) {
        if self.holds_locks {
            self.shared.locks.release_all(self.id);
            self.holds_locks = false;
        }
    }

    fn lock(&mut self, ctx: &ExecContext<'_>, key: &TableKey, exclusive: bool) -> Result<(), ServerError> {
        if key.temporary {
            return Ok(());
        }
        let lock_key: LockKey = (key.db.clone(), key.name.clone());
        match self
            .shared
            .locks
            .acquire(self.id, &lock_key, exclusive, ctx.lock_wait_timeout, ctx.kill)
        {
            Ok(()) => {
                self.holds_locks = true;
                Ok(())
            }
            Err(ServerError::Deadlock) => {
                self.rollback_requested = true;
                Err(ServerError::Deadlock)
            }
            Err(err) => Err(err),
        }
    }

    fn exists(&self, catalog: &Catalog, key: &TableKey) -> bool {
        if key.temporary {
            self.temporary
                .contains_key(&(key.db.clone(), key.name.clone()))
        } else {
            catalog
                .databases
                .get(&key.db)
                .is_some_and(|t| t.contains_key(&key.name))
        }
    }

    /// Runs `f` on the resolved table, temporary tables shadowing base ones.
    fn with_table<R>(
        &mut self,
        key: &TableKey,
        f: impl FnOnce(&mut TableData) -> Result<R, ServerError>,
    ) -> Result<R, ServerError> {
        let missing = || ServerError::NoSuchTable {
            db: key.db.clone(),
            table: key.name.clone(),
        };
        if key.temporary {
            let table = self
                .temporary
                .get_mut(&(key.db.clone(), key.name.clone()))
                .ok_or_else(missing)?;
            return f(table);
        }
        let mut catalog = self.shared.write()?;
        if !catalog.databases.contains_key(&key.db) {
            return Err(ServerError::UnknownDatabase(key.db.clone()));
        }
        let table = catalog
            .databases
            .get_mut(&key.db)
            .and_then(|t| t.get_mut(&key.name))
            .ok_or_else(missing)?;
        f(table)
    }

    fn read_table(&self, key: &TableKey) -> Result<TableData, ServerError> {
        if key.temporary {
            return self
                .temporary
                .get(&(key.db.clone(), key.name.clone()))
                .cloned()
                .ok_or_else(|| ServerError::NoSuchTable {
                    db: key.db.clone(),
                    table: key.name.clone(),
                });
        }
        let catalog = self.shared.read()?;
        let tables = catalog
            .databases
            .get(&key.db)
            .ok_or_else(|| ServerError::UnknownDatabase(key.db.clone()))?;
        tables
            .get(&key.name)
            .cloned()
            .ok_or_else(|| ServerError::NoSuchTable {
                db: key.db.clone(),
                table: key.name.clone(),
            })
    }

    fn first_table(stmt: &StatementDescriptor) -> Result<&TableRef, ServerError> {
        stmt.tables
            .first()
            .ok_or_else(|| ServerError::Internal(format!("{} without a table", stmt.kind.name())))
    }

    fn select(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        params: &SelectParams,
    ) -> Result<ExecOutcome, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        let key = self.key(&db, &table.name);
        if params.for_update || params.lock_in_share_mode {
            self.ensure_transaction();
            self.lock(ctx, &key, params.for_update)?;
        }
        let data = self.read_table(&key)?;
        let filter_idx = params
            .filter
            .as_ref()
            .map(|f| data.column_index(&f.column, &table.name))
            .transpose()?;

        let mut columns = Vec::new();
        for item in &params.items {
            match &item.expr {
                Expr::Star => columns.extend(
                    data.columns
                        .iter()
                        .map(|c| Column::of_table(&db, &table.name, c.clone())),
                ),
                Expr::Column(name) => {
                    data.column_index(name, &table.name)?;
                    columns.push(Column::of_table(&db, &table.name, item.label.clone()));
                }
                _ => columns.push(Column::new(item.label.clone())),
            }
        }
        let mut result = ResultSet::new(columns);
        let aggregate = params.items.iter().any(|i| i.expr == Expr::CountStar);

        let mut examined = 0u64;
        let mut matched = 0u64;
        let mut first_match: Option<&Vec<Value>> = None;
        for (n, row) in data.rows.iter().enumerate() {
            if n % KILL_CHECK_INTERVAL == 0 {
                ctx.kill.check()?;
            }
            examined += 1;
            if !data.matches(row, params.filter.as_ref(), filter_idx) {
                continue;
            }
            matched += 1;
            if aggregate {
                first_match.get_or_insert(row);
                continue;
            }
            if params.limit.is_some_and(|l| result.row_count() as u64 >= l) {
                break;
            }
            result.push_row(self.project(ctx, &data, &table.name, params, Some(row), matched)?);
        }
        if aggregate && params.limit != Some(0) {
            result.push_row(self.project(ctx, &data, &table.name, params, first_match.map(Vec::as_slice), matched)?);
        }
        Ok(ExecOutcome::rows(result, examined))
    }

    fn project(
        &self,
        ctx: &ExecContext<'_>,
        data: &TableData,
        table: &str,
        params: &SelectParams,
        row: Option<&[Value]>,
        count: u64,
    ) -> Result<Vec<Option<String>>, ServerError> {
        let mut out = Vec::new();
        for item in &params.items {
            match &item.expr {
                Expr::Star => match row {
                    Some(row) => out.extend(row.iter().map(Value::to_text_cell)),
                    None => out.extend(data.columns.iter().map(|_| None)),
                },
                Expr::Column(name) => {
                    let idx = data.column_index(name, table)?;
                    out.push(row.and_then(|r| r[idx].to_text_cell()));
                }
                Expr::CountStar => out.push(Some(count.to_string())),
                Expr::Literal(v) => out.push(v.to_text_cell()),
                other => out.push((ctx.scalar)(other)?.to_text_cell()),
            }
        }
        Ok(out)
    }

    fn insert(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        params: &InsertParams,
        replace: bool,
    ) -> Result<ExecOutcome, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        let key = self.key(&db, &table.name);
        self.ensure_transaction();
        self.lock(ctx, &key, true)?;
        self.capture(&key)?;
        let name = table.name.clone();
        let columns = params.columns.clone();
        let rows = params.rows.clone();

        self.with_table(&key, move |data| {
            let positions = match &columns {
                Some(cols) => cols
                    .iter()
                    .map(|c| data.column_index(c, &name))
                    .collect::<Result<Vec<_>, _>>()?,
                None => (0..data.columns.len()).collect(),
            };
            let mut prepared = Vec::with_capacity(rows.len());
            for (n, values) in rows.iter().enumerate() {
                if values.len() != positions.len() {
                    return Err(ServerError::ColumnCountMismatch(n + 1));
                }
                let mut row = vec![Value::Null; data.columns.len()];
                for (pos, value) in positions.iter().zip(values) {
                    row[*pos] = value.clone();
                }
                prepared.push(row);
            }

            let mut affected = 0u64;
            for row in prepared {
                if replace {
                    let before = data.rows.len();
                    data.rows.retain(|r| !r[0].sql_eq(&row[0]));
                    affected += (before - data.rows.len()) as u64;
                }
                data.rows.push(row);
                affected += 1;
            }
            Ok(ExecOutcome::affected(affected))
        })
    }

    fn update(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        params: &UpdateParams,
    ) -> Result<ExecOutcome, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        let key = self.key(&db, &table.name);
        self.ensure_transaction();
        self.lock(ctx, &key, true)?;
        self.capture(&key)?;
        let name = table.name.clone();
        let kill = ctx.kill;

        self.with_table(&key, |data| {
            let filter_idx = params
                .filter
                .as_ref()
                .map(|f| data.column_index(&f.column, &name))
                .transpose()?;
            let targets = params
                .assignments
                .iter()
                .map(|(c, v)| data.column_index(c, &name).map(|i| (i, v.clone())))
                .collect::<Result<Vec<_>, _>>()?;

            let (mut matched, mut changed, mut examined) = (0u64, 0u64, 0u64);
            let filter = params.filter.as_ref();
            for n in 0..data.rows.len() {
                if n % KILL_CHECK_INTERVAL == 0 {
                    kill.check()?;
                }
                examined += 1;
                if !data.matches(&data.rows[n], filter, filter_idx) {
                    continue;
                }
                matched += 1;
                let row = &mut data.rows[n];
                let mut row_changed = false;
                for (i, v) in &targets {
                    if row[*i] != *v {
                        row[*i] = v.clone();
                        row_changed = true;
                    }
                }
                if row_changed {
                    changed += 1;
                }
            }
            Ok(ExecOutcome {
                affected: changed,
                examined,
                info: Some(format!("Rows matched: {matched}  Changed: {changed}  Warnings: 0")),
                ..ExecOutcome::default()
            })
        })
    }

    fn delete(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        filter: Option<&Filter>,
    ) -> Result<ExecOutcome, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        let key = self.key(&db, &table.name);
        self.ensure_transaction();
        self.lock(ctx, &key, true)?;
        self.capture(&key)?;
        let name = table.name.clone();
        let kill = ctx.kill;

        self.with_table(&key, |data| {
            let filter_idx = filter
                .map(|f| data.column_index(&f.column, &name))
                .transpose()?;
            kill.check()?;
            let examined = data.rows.len() as u64;
            let before = data.rows.len();
            let columns_filter = (filter, filter_idx);
            data.rows.retain(|row| match columns_filter {
                (Some(f), Some(i)) => !row[i].sql_eq(&f.value),
                _ => false,
            });
            Ok(ExecOutcome {
                affected: (before - data.rows.len()) as u64,
                examined,
                ..ExecOutcome::default()
            })
        })
    }

    fn create_table(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        params: &CreateTableParams,
    ) -> Result<ExecOutcome, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        for (i, column) in params.columns.iter().enumerate() {
            if params.columns[..i].contains(column) {
                return Err(ServerError::DuplicateColumn(column.clone()));
            }
        }
        let data = TableData::new(params.columns.clone(), params.engine.as_deref());

        if table.temporary {
            let key = (db.clone(), table.name.clone());
            if !self.shared.read()?.databases.contains_key(&db) {
                return Err(ServerError::UnknownDatabase(db));
            }
            if self.temporary.contains_key(&key) {
                return self.exists_outcome(&table.name, params.if_not_exists);
            }
            debug!(session = self.id, db = %db, table = %table.name, "temporary table created");
            self.temporary.insert(key, data);
            return Ok(ExecOutcome::affected(0));
        }

        let mut catalog = self.shared.write()?;
        let tables = catalog
            .databases
            .get_mut(&db)
            .ok_or_else(|| ServerError::UnknownDatabase(db.clone()))?;
        if tables.contains_key(&table.name) {
            drop(catalog);
            return self.exists_outcome(&table.name, params.if_not_exists);
        }
        tables.insert(table.name.clone(), data);
        Ok(ExecOutcome::affected(0))
    }

    fn exists_outcome(&self, name: &str, if_not_exists: bool) -> Result<ExecOutcome, ServerError> {
        let err = ServerError::TableExists(name.to_string());
        if if_not_exists {
            Ok(ExecOutcome::affected(0).with_warning(Warning::note_from(&err)))
        } else {
            Err(err)
        }
    }

    fn drop_tables(
        &mut self,
        ctx: &ExecContext<'_>,
        tables: &[TableRef],
        if_exists: bool,
    ) -> Result<ExecOutcome, ServerError> {
        let mut missing = Vec::new();
        let mut resolved = Vec::new();
        {
            let catalog = self.shared.read()?;
            for table in tables {
                let db = ctx.resolve_db(table)?.to_string();
                let temp_key = (db.clone(), table.name.clone());
                if self.temporary.contains_key(&temp_key) {
                    resolved.push((db, table.name.clone(), true));
                } else if !table.temporary
                    && catalog
                        .databases
                        .get(&db)
                        .is_some_and(|t| t.contains_key(&table.name))
                {
                    resolved.push((db, table.name.clone(), false));
                } else {
                    missing.push(format!("{db}.{}", table.name));
                }
            }
        }
        if !missing.is_empty() && !if_exists {
            return Err(ServerError::BadTable(missing.join(",")));
        }

        let mut catalog = self.shared.write()?;
        for (db, name, temporary) in resolved {
            if temporary {
                self.temporary.remove(&(db, name));
            } else if let Some(t) = catalog.databases.get_mut(&db) {
                t.remove(&name);
            }
        }
        let mut outcome = ExecOutcome::affected(0);
        for name in missing {
            outcome
                .warnings
                .push(Warning::note_from(&ServerError::BadTable(name)));
        }
        Ok(outcome)
    }

    fn alter_table(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        op: &AlterTableOp,
    ) -> Result<ExecOutcome, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        let key = self.key(&db, &table.name);
        self.with_table(&key, |data| {
            match op {
                AlterTableOp::AddColumn(column) => {
                    if data.columns.contains(column) {
                        return Err(ServerError::DuplicateColumn(column.clone()));
                    }
                    data.columns.push(column.clone());
                    for row in &mut data.rows {
                        row.push(Value::Null);
                    }
                }
                AlterTableOp::DropColumn(column) => {
                    let idx = data
                        .columns
                        .iter()
                        .position(|c| c == column)
                        .ok_or_else(|| ServerError::CantDropKey(column.clone()))?;
                    data.columns.remove(idx);
                    for row in &mut data.rows {
                        row.remove(idx);
                    }
                }
            }
            Ok(ExecOutcome::affected(0))
        })
    }

    fn rename_tables(
        &mut self,
        ctx: &ExecContext<'_>,
        tables: &[TableRef],
    ) -> Result<ExecOutcome, ServerError> {
        let mut catalog = self.shared.write()?;
        for pair in tables.chunks(2) {
            let [from, to] = pair else {
                return Err(ServerError::Internal("unpaired RENAME TABLE".into()));
            };
            let from_db = ctx.resolve_db(from)?.to_string();
            let to_db = ctx.resolve_db(to)?.to_string();
            if !catalog.databases.contains_key(&to_db) {
                return Err(ServerError::UnknownDatabase(to_db));
            }
            if catalog
                .databases
                .get(&to_db)
                .is_some_and(|t| t.contains_key(&to.name))
            {
                return Err(ServerError::TableExists(to.name.clone()));
            }
            let data = catalog
                .databases
                .get_mut(&from_db)
                .and_then(|t| t.remove(&from.name))
                .ok_or_else(|| ServerError::NoSuchTable {
                    db: from_db.clone(),
                    table: from.name.clone(),
                })?;
            if let Some(t) = catalog.databases.get_mut(&to_db) {
                t.insert(to.name.clone(), data);
            }
        }
        Ok(ExecOutcome::affected(0))
    }

    fn index_ddl(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        name: &str,
        create: bool,
    ) -> Result<ExecOutcome, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        let key = self.key(&db, &table.name);
        self.with_table(&key, |data| {
            let pos = data.indexes.iter().position(|i| i == name);
            match (create, pos) {
                (true, Some(_)) => return Err(ServerError::DuplicateKeyName(name.to_string())),
                (true, None) => data.indexes.push(name.to_string()),
                (false, Some(p)) => {
                    data.indexes.remove(p);
                }
                (false, None) => return Err(ServerError::CantDropKey(name.to_string())),
            }
            Ok(ExecOutcome::affected(0))
        })
    }

    fn create_database(&mut self, name: &str, if_not_exists: bool) -> Result<ExecOutcome, ServerError> {
        let mut catalog = self.shared.write()?;
        if catalog.databases.contains_key(name) {
            let err = ServerError::DatabaseExists(name.to_string());
            return if if_not_exists {
                Ok(ExecOutcome::affected(0).with_warning(Warning::note_from(&err)))
            } else {
                Err(err)
            };
        }
        catalog.databases.insert(name.to_string(), BTreeMap::new());
        Ok(ExecOutcome::affected(1))
    }

    fn drop_database(&mut self, name: &str, if_exists: bool) -> Result<ExecOutcome, ServerError> {
        let mut catalog = self.shared.write()?;
        match catalog.databases.remove(name) {
            Some(tables) => {
                self.temporary.retain(|(db, _), _| db != name);
                Ok(ExecOutcome::affected(tables.len() as u64))
            }
            None => {
                let err = ServerError::DatabaseNotExists(name.to_string());
                if if_exists {
                    Ok(ExecOutcome::affected(0).with_warning(Warning::note_from(&err)))
                } else {
                    Err(err)
                }
            }
        }
    }

    fn truncate(&mut self, ctx: &ExecContext<'_>, table: &TableRef) -> Result<ExecOutcome, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        let key = self.key(&db, &table.name);
        self.lock(ctx, &key, true)?;
        self.with_table(&key, |data| {
            data.rows.clear();
            Ok(ExecOutcome::affected(0))
        })
    }
}

impl EngineSession for MemorySession {
    fn begin(&mut self) -> Result<(), ServerError> {
        if self.transaction.is_none() {
            self.transaction = Some(UndoLevel::default());
        }
        Ok(())
    }

    fn commit_statement(&mut self) -> Result<(), ServerError> {
        self.statement = None;
        Ok(())
    }

    fn rollback_statement(&mut self) -> RollbackReport {
        match self.statement.take() {
            Some(level) => self.restore(level),
            None => RollbackReport::default(),
        }
    }

    fn commit_transaction(&mut self) -> Result<(), ServerError> {
        self.statement = None;
        self.savepoints.clear();
        self.transaction = None;
        self.release_locks();
        Ok(())
    }

    fn rollback_transaction(&mut self) -> RollbackReport {
        self.statement = None;
        self.savepoints.clear();
        let report = match self.transaction.take() {
            Some(level) => self.restore(level),
            None => RollbackReport::default(),
        };
        self.release_locks();
        report
    }

    fn savepoint(&mut self, name: &str) -> Result<(), ServerError> {
        self.begin()?;
        if let Some(pos) = self
            .savepoints
            .iter()
            .position(|s| s.name.as_deref() == Some(name))
        {
            self.savepoints.remove(pos);
        }
        self.savepoints.push(UndoLevel {
            name: Some(name.to_string()),
            ..UndoLevel::default()
        });
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, name: &str) -> Result<RollbackReport, ServerError> {
        let pos = self
            .savepoints
            .iter()
            .position(|s| s.name.as_deref() == Some(name))
            .ok_or_else(|| ServerError::SavepointNotExist(name.to_string()))?;
        let later_unsafe = self.savepoints[pos..].iter().any(|s| s.unsafe_tables);
        let mut level = self.savepoints.split_off(pos).remove(0);
        let report = self.restore(UndoLevel {
            name: None,
            images: std::mem::take(&mut level.images),
            unsafe_tables: later_unsafe,
        });
        // the savepoint itself survives the rollback
        level.unsafe_tables = false;
        self.savepoints.push(level);
        Ok(report)
    }

    fn release_savepoint(&mut self, name: &str) -> Result<(), ServerError> {
        let pos = self
            .savepoints
            .iter()
            .position(|s| s.name.as_deref() == Some(name))
            .ok_or_else(|| ServerError::SavepointNotExist(name.to_string()))?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    fn take_rollback_request(&mut self) -> bool {
        std::mem::take(&mut self.rollback_requested)
    }

    fn in_transaction(&self) -> bool {
        self.holds_locks
            || self
                .transaction
                .as_ref()
                .is_some_and(|t| !t.images.is_empty() || t.unsafe_tables)
    }

    fn is_temporary(&self, db: &str, table: &str) -> bool {
        self.temporary
            .contains_key(&(db.to_string(), table.to_string()))
    }

    fn temporary_tables(&self) -> Vec<(String, String)> {
        self.temporary.keys().cloned().collect()
    }

    fn execute(
        &mut self,
        ctx: &ExecContext<'_>,
        stmt: &StatementDescriptor,
    ) -> Result<ExecOutcome, ServerError> {
        ctx.kill.check()?;
        match (&stmt.kind, &stmt.params) {
            (StatementKind::Select, StatementParams::Select(p)) => {
                let table = Self::first_table(stmt)?;
                self.select(ctx, table, p)
            }
            (StatementKind::Insert, StatementParams::Insert(p)) => {
                self.insert(ctx, Self::first_table(stmt)?, p, false)
            }
            (StatementKind::Replace, StatementParams::Insert(p)) => {
                self.insert(ctx, Self::first_table(stmt)?, p, true)
            }
            (StatementKind::Update, StatementParams::Update(p)) => {
                self.update(ctx, Self::first_table(stmt)?, p)
            }
            (StatementKind::Delete, StatementParams::Delete { filter }) => {
                self.delete(ctx, Self::first_table(stmt)?, filter.as_ref())
            }
            (StatementKind::CreateTable, StatementParams::CreateTable(p)) => {
                self.create_table(ctx, Self::first_table(stmt)?, p)
            }
            (StatementKind::DropTable, StatementParams::DropTable { if_exists }) => {
                self.drop_tables(ctx, &stmt.tables, *if_exists)
            }
            (StatementKind::AlterTable, StatementParams::AlterTable(op)) => {
                self.alter_table(ctx, Self::first_table(stmt)?, op)
            }
            (StatementKind::RenameTable, _) => self.rename_tables(ctx, &stmt.tables),
            (StatementKind::Truncate, _) => self.truncate(ctx, Self::first_table(stmt)?),
            (StatementKind::CreateIndex, StatementParams::Index { name }) => {
                self.index_ddl(ctx, Self::first_table(stmt)?, name, true)
            }
            (StatementKind::DropIndex, StatementParams::Index { name }) => {
                self.index_ddl(ctx, Self::first_table(stmt)?, name, false)
            }
            (StatementKind::CreateDb, StatementParams::Database { name, if_flag }) => {
                self.create_database(name, *if_flag)
            }
            (StatementKind::DropDb, StatementParams::Database { name, if_flag }) => {
                self.drop_database(name, *if_flag)
            }
            (kind, _) => Err(ServerError::Internal(format!(
                "engine cannot execute {}",
                kind.name()
            ))),
        }
    }

    fn handler_read(
        &mut self,
        ctx: &ExecContext<'_>,
        table: &TableRef,
        read: HandlerRead,
        position: &mut usize,
    ) -> Result<ResultSet, ServerError> {
        let db = ctx.resolve_db(table)?.to_string();
        let key = self.key(&db, &table.name);
        let data = self.read_table(&key)?;
        if read == HandlerRead::First {
            *position = 0;
        }
        let mut result = ResultSet::new(
            data.columns
                .iter()
                .map(|c| Column::of_table(&db, &table.name, c.clone()))
                .collect(),
        );
        if let Some(row) = data.rows.get(*position) {
            result.push_row(row.iter().map(Value::to_text_cell).collect());
            *position += 1;
        }
        Ok(result)
    }

    fn close(&mut self) {
        let report = self.rollback_transaction();
        if report.unsafe_tables {
            debug!(session = self.id, "non-transactional changes kept at disconnect");
        }
        self.temporary.clear();
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Timeout;
    use crate::parser::parse_statement;
    use crate::session::KillToken;

    fn no_scalar(_: &Expr) -> Result<Value, ServerError> {
        Ok(Value::Null)
    }

    fn run(
        session: &mut Box<dyn EngineSession>,
        kill: &KillToken,
        sql: &str,
    ) -> Result<ExecOutcome, ServerError> {
        let ctx = ExecContext {
            session_id: 1,
            db: Some("test"),
            kill,
            lock_wait_timeout: Timeout::from_millis(50),
            scalar: &no_scalar,
        };
        let stmt = parse_statement(sql)?;
        let out = session.execute(&ctx, &stmt);
        match &out {
            Ok(_) => session.commit_statement()?,
            Err(_) => {
                session.rollback_statement();
            }
        }
        out
    }

    fn setup() -> (MemoryEngine, Box<dyn EngineSession>, KillToken) {
        let engine = MemoryEngine::with_databases(&["test"]);
        let mut session = engine.open_session(1);
        let kill = KillToken::new();
        run(&mut session, &kill, "CREATE TABLE t (id INT, name TEXT)").unwrap();
        session.commit_transaction().unwrap();
        (engine, session, kill)
    }

    #[test]
    fn test_insert_select_roundtrip() {
        let (_engine, mut s, kill) = setup();
        run(&mut s, &kill, "INSERT INTO t VALUES (1, 'a'), (2, 'b')").unwrap();
        let out = run(&mut s, &kill, "SELECT name FROM t WHERE id = 2").unwrap();
        let result = out.result.unwrap();
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.cell(0, "name"), Some("b"));
        assert_eq!(out.examined, 2);
    }

    #[test]
    fn test_statement_rollback_restores_rows() {
        let (engine, mut s, kill) = setup();
        s.begin().unwrap();
        run(&mut s, &kill, "INSERT INTO t VALUES (1, 'a')").unwrap();
        // second row has the wrong arity: the whole statement is undone
        let err = run(&mut s, &kill, "INSERT INTO t VALUES (2, 'b'), (3)").unwrap_err();
        assert_eq!(err, ServerError::ColumnCountMismatch(2));
        assert_eq!(engine.row_count("test", "t"), Some(1));
        s.rollback_transaction();
        assert_eq!(engine.row_count("test", "t"), Some(0));
    }

    #[test]
    fn test_savepoints() {
        let (engine, mut s, kill) = setup();
        s.begin().unwrap();
        run(&mut s, &kill, "INSERT INTO t VALUES (1, 'a')").unwrap();
        s.savepoint("sp1").unwrap();
        run(&mut s, &kill, "INSERT INTO t VALUES (2, 'b')").unwrap();
        s.rollback_to_savepoint("sp1").unwrap();
        assert_eq!(engine.row_count("test", "t"), Some(1));
        run(&mut s, &kill, "INSERT INTO t VALUES (3, 'c')").unwrap();
        s.rollback_to_savepoint("sp1").unwrap();
        assert_eq!(engine.row_count("test", "t"), Some(1));
        s.release_savepoint("sp1").unwrap();
        assert_eq!(
            s.rollback_to_savepoint("sp1").unwrap_err(),
            ServerError::SavepointNotExist("sp1".into())
        );
        s.commit_transaction().unwrap();
        assert_eq!(engine.row_count("test", "t"), Some(1));
    }

    #[test]
    fn test_non_transactional_table_reports_unsafe_rollback() {
        let (engine, mut s, kill) = setup();
        run(&mut s, &kill, "CREATE TABLE m (id INT) ENGINE=MEMORY").unwrap();
        s.begin().unwrap();
        run(&mut s, &kill, "INSERT INTO m VALUES (1)").unwrap();
        let report = s.rollback_transaction();
        assert!(report.unsafe_tables);
        assert_eq!(engine.row_count("test", "m"), Some(1));
    }

    #[test]
    fn test_temporary_table_shadows_and_is_private() {
        let (engine, mut s, kill) = setup();
        run(&mut s, &kill, "CREATE TEMPORARY TABLE t (x INT)").unwrap();
        run(&mut s, &kill, "INSERT INTO t VALUES (5)").unwrap();
        assert!(s.is_temporary("test", "t"));
        assert_eq!(engine.row_count("test", "t"), Some(0));
        let mut other = engine.open_session(2);
        assert!(!other.is_temporary("test", "t"));
        run(&mut other, &kill, "DROP TABLE t").unwrap();
        assert!(!engine.table_exists("test", "t"));
        s.close();
        assert!(s.temporary_tables().is_empty());
    }

    #[test]
    fn test_for_update_blocks_writer_until_commit() {
        let (_engine, mut a, kill) = setup();
        let engine_b = _engine.clone();
        let mut b = engine_b.open_session(2);
        a.begin().unwrap();
        run(&mut a, &kill, "SELECT * FROM t FOR UPDATE").unwrap();
        let err = run(&mut b, &kill, "DELETE FROM t").unwrap_err();
        assert_eq!(err, ServerError::LockWaitTimeout);
        a.commit_transaction().unwrap();
        run(&mut b, &kill, "DELETE FROM t").unwrap();
    }

    #[test]
    fn test_ddl_errors() {
        let (_engine, mut s, kill) = setup();
        assert_eq!(
            run(&mut s, &kill, "CREATE TABLE t (a INT)").unwrap_err(),
            ServerError::TableExists("t".into())
        );
        let out = run(&mut s, &kill, "CREATE TABLE IF NOT EXISTS t (a INT)").unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(
            run(&mut s, &kill, "DROP TABLE nope").unwrap_err(),
            ServerError::BadTable("test.nope".into())
        );
        assert_eq!(
            run(&mut s, &kill, "CREATE TABLE d (a INT, a INT)").unwrap_err(),
            ServerError::DuplicateColumn("a".into())
        );
        assert_eq!(
            run(&mut s, &kill, "SELECT zz FROM t").unwrap_err(),
            ServerError::BadField {
                column: "zz".into(),
                table: "t".into()
            }
        );
    }

    #[test]
    fn test_handler_cursor() {
        let (_engine, mut s, kill) = setup();
        run(&mut s, &kill, "INSERT INTO t VALUES (1, 'a'), (2, 'b')").unwrap();
        let ctx = ExecContext {
            session_id: 1,
            db: Some("test"),
            kill: &kill,
            lock_wait_timeout: Timeout::from_millis(50),
            scalar: &no_scalar,
        };
        let t = TableRef::new(None, "t");
        let mut pos = 0;
        let first = s.handler_read(&ctx, &t, HandlerRead::First, &mut pos).unwrap();
        assert_eq!(first.cell(0, "id"), Some("1"));
        let next = s.handler_read(&ctx, &t, HandlerRead::Next, &mut pos).unwrap();
        assert_eq!(next.cell(0, "id"), Some("2"));
        let end = s.handler_read(&ctx, &t, HandlerRead::Next, &mut pos).unwrap();
        assert_eq!(end.row_count(), 0);
    }
}
