//! In-process store.
//!
//! Content is always held stamped, so the same store can serve as plain or
//! mergeable. Local writes take the next tick of a per-store clock; merged
//! writes keep their incoming stamps and only win if they are later.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use storesync_types::{
    Changes, Content, MergeableChanges, MergeableContent, RowChanges, Stamped, TableChanges,
};

use super::{ListenerId, MergeableStore, Store, StoreError, TransactionListener};
use crate::lock;

#[derive(Default)]
struct State {
    content: MergeableContent,
    changes: Changes,
    mergeable_changes: MergeableChanges,
    clock: u64,
}

impl State {
    fn tick(&mut self) -> String {
        self.clock += 1;
        format!("{:016x}", self.clock)
    }

    /// Move the clock past a stamp written elsewhere.
    fn observe(&mut self, time: &str) {
        if let Ok(seen) = u64::from_str_radix(time, 16) {
            self.clock = self.clock.max(seen);
        }
    }
}

/// A transactional in-memory store.
///
/// Share it as `Arc<MemoryStore>`; it coerces to `Arc<dyn Store>`.
pub struct MemoryStore {
    mergeable: bool,
    state: Mutex<State>,
    listeners: Mutex<BTreeMap<u64, TransactionListener>>,
    next_listener: AtomicU64,
    fail_next_add: Mutex<Option<String>>,
}

impl MemoryStore {
    fn with_merge(mergeable: bool) -> Self {
        Self {
            mergeable,
            state: Mutex::new(State::default()),
            listeners: Mutex::new(BTreeMap::new()),
            next_listener: AtomicU64::new(1),
            fail_next_add: Mutex::new(None),
        }
    }

    /// Create a store exposing only the plain surface.
    pub fn new_plain() -> Self {
        Self::with_merge(false)
    }

    /// Create a store that also exposes [`MergeableStore`].
    pub fn new_mergeable() -> Self {
        Self::with_merge(true)
    }

    /// Run a local transaction, then fire did-finish-transaction listeners.
    ///
    /// Listeners fire even if the transaction changed nothing.
    pub fn transaction<F>(&self, f: F)
    where
        F: FnOnce(&mut Transaction<'_>),
    {
        self.commit(|state| {
            let time = state.tick();
            let mut tx = Transaction::new(&mut state.content, time);
            f(&mut tx);
            tx.finish()
        });
    }

    /// Current value of a keyed value.
    pub fn value(&self, id: &str) -> Option<Value> {
        lock(&self.state)
            .content
            .values
            .value
            .get(id)
            .and_then(|leaf| leaf.value.clone())
    }

    /// Current value of a cell.
    pub fn cell(&self, table: &str, row: &str, cell: &str) -> Option<Value> {
        lock(&self.state)
            .content
            .tables
            .value
            .get(table)
            .and_then(|rows| rows.value.get(row))
            .and_then(|cells| cells.value.get(cell))
            .and_then(|leaf| leaf.value.clone())
    }

    /// Number of registered transaction listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Make the next listener registration fail.
    pub fn fail_next_add_listener(&self, reason: impl Into<String>) {
        *lock(&self.fail_next_add) = Some(reason.into());
    }

    fn commit<F>(&self, f: F)
    where
        F: FnOnce(&mut State) -> (Changes, MergeableChanges),
    {
        {
            let mut state = lock(&self.state);
            let (changes, mergeable_changes) = f(&mut state);
            state.changes = changes;
            state.mergeable_changes = mergeable_changes;
        }
        self.notify();
    }

    fn notify(&self) {
        let listeners: Vec<TransactionListener> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }
}

impl Store for MemoryStore {
    fn content(&self) -> Content {
        lock(&self.state).content.to_content()
    }

    fn transaction_changes(&self) -> Changes {
        lock(&self.state).changes.clone()
    }

    fn set_content(&self, content: Content) {
        self.transaction(|tx| tx.replace(&content));
    }

    fn apply_changes(&self, changes: Changes) {
        self.transaction(|tx| tx.apply(&changes));
    }

    fn add_did_finish_transaction_listener(
        &self,
        listener: TransactionListener,
    ) -> Result<ListenerId, StoreError> {
        if let Some(reason) = lock(&self.fail_next_add).take() {
            return Err(StoreError::ListenerRegistration(reason));
        }
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).insert(id, listener);
        Ok(ListenerId::new(id))
    }

    fn del_listener(&self, id: ListenerId) {
        lock(&self.listeners).remove(&id.value());
    }

    fn as_mergeable(&self) -> Option<&dyn MergeableStore> {
        if self.mergeable {
            Some(self)
        } else {
            None
        }
    }
}

impl MergeableStore for MemoryStore {
    fn mergeable_content(&self) -> MergeableContent {
        lock(&self.state).content.clone()
    }

    fn transaction_mergeable_changes(&self) -> MergeableChanges {
        lock(&self.state).mergeable_changes.clone()
    }

    fn set_mergeable_content(&self, content: MergeableContent) {
        self.commit(|state| {
            let before = state.content.to_content();
            state.observe(&content.tables.time);
            state.observe(&content.values.time);
            state.content = content.clone();
            let changes = diff(&before, &state.content.to_content());
            (
                changes,
                MergeableChanges {
                    tables: content.tables,
                    values: content.values,
                },
            )
        });
    }

    fn apply_mergeable_changes(&self, changes: MergeableChanges) {
        self.commit(|state| {
            state.observe(&changes.tables.time);
            state.observe(&changes.values.time);
            let mut tx = Transaction::new(&mut state.content, String::new());
            tx.merge_stamped(&changes);
            tx.finish()
        });
    }

    fn set_default_content(&self, content: Content) {
        self.commit(|state| {
            let mut tx = Transaction::new(&mut state.content, String::new());
            tx.fill_defaults(&content);
            tx.finish()
        });
    }
}

/// Writes made inside [`MemoryStore::transaction`].
///
/// Writes that leave a value as it was are not recorded.
pub struct Transaction<'a> {
    content: &'a mut MergeableContent,
    time: String,
    changes: Changes,
    mergeable: MergeableChanges,
}

impl<'a> Transaction<'a> {
    fn new(content: &'a mut MergeableContent, time: String) -> Self {
        Self {
            content,
            time,
            changes: Changes::new(),
            mergeable: MergeableChanges::default(),
        }
    }

    /// Set a keyed value.
    pub fn set_value(&mut self, id: &str, value: Value) -> &mut Self {
        if self.live_value(id) != Some(&value) {
            let time = self.time.clone();
            self.write_value(id, Some(value), &time);
        }
        self
    }

    /// Delete a keyed value.
    pub fn del_value(&mut self, id: &str) -> &mut Self {
        if self.live_value(id).is_some() {
            let time = self.time.clone();
            self.write_value(id, None, &time);
        }
        self
    }

    /// Set a cell.
    pub fn set_cell(&mut self, table: &str, row: &str, cell: &str, value: Value) -> &mut Self {
        if self.live_cell(table, row, cell) != Some(&value) {
            let time = self.time.clone();
            self.write_cell(table, row, cell, Some(value), &time);
        }
        self
    }

    /// Delete a cell.
    pub fn del_cell(&mut self, table: &str, row: &str, cell: &str) -> &mut Self {
        if self.live_cell(table, row, cell).is_some() {
            let time = self.time.clone();
            self.write_cell(table, row, cell, None, &time);
        }
        self
    }

    /// Delete every cell of a row.
    pub fn del_row(&mut self, table: &str, row: &str) -> &mut Self {
        let cells: Vec<String> = self
            .content
            .tables
            .value
            .get(table)
            .and_then(|rows| rows.value.get(row))
            .map(|cells| cells.value.keys().cloned().collect())
            .unwrap_or_default();
        for cell in cells {
            self.del_cell(table, row, &cell);
        }
        self
    }

    /// Delete every row of a table.
    pub fn del_table(&mut self, table: &str) -> &mut Self {
        let rows: Vec<String> = self
            .content
            .tables
            .value
            .get(table)
            .map(|rows| rows.value.keys().cloned().collect())
            .unwrap_or_default();
        for row in rows {
            self.del_row(table, &row);
        }
        self
    }

    fn replace(&mut self, content: &Content) {
        let current = self.content.to_content();
        for (table_id, rows) in &current.tables {
            for (row_id, cells) in rows {
                for cell_id in cells.keys() {
                    let kept = content
                        .tables
                        .get(table_id)
                        .and_then(|rows| rows.get(row_id))
                        .is_some_and(|cells| cells.contains_key(cell_id));
                    if !kept {
                        self.del_cell(table_id, row_id, cell_id);
                    }
                }
            }
        }
        for value_id in current.values.keys() {
            if !content.values.contains_key(value_id) {
                self.del_value(value_id);
            }
        }
        for (table_id, rows) in &content.tables {
            for (row_id, cells) in rows {
                for (cell_id, value) in cells {
                    self.set_cell(table_id, row_id, cell_id, value.clone());
                }
            }
        }
        for (value_id, value) in &content.values {
            self.set_value(value_id, value.clone());
        }
    }

    fn apply(&mut self, changes: &Changes) {
        for (table_id, table) in &changes.tables {
            let Some(rows) = table else {
                self.del_table(table_id);
                continue;
            };
            for (row_id, row) in rows {
                let Some(cells) = row else {
                    self.del_row(table_id, row_id);
                    continue;
                };
                for (cell_id, cell) in cells {
                    match cell {
                        Some(value) => self.set_cell(table_id, row_id, cell_id, value.clone()),
                        None => self.del_cell(table_id, row_id, cell_id),
                    };
                }
            }
        }
        for (value_id, value) in &changes.values {
            match value {
                Some(value) => self.set_value(value_id, value.clone()),
                None => self.del_value(value_id),
            };
        }
    }

    /// Last-writer-wins merge, leaf by leaf.
    fn merge_stamped(&mut self, changes: &MergeableChanges) {
        for (table_id, rows) in &changes.tables.value {
            for (row_id, cells) in &rows.value {
                for (cell_id, leaf) in &cells.value {
                    let existing = self.cell_leaf(table_id, row_id, cell_id).map(|l| l.time.as_str());
                    if is_newer(&leaf.time, existing) {
                        self.write_cell(table_id, row_id, cell_id, leaf.value.clone(), &leaf.time);
                    }
                }
            }
        }
        for (value_id, leaf) in &changes.values.value {
            let existing = self.value_leaf(value_id).map(|l| l.time.as_str());
            if is_newer(&leaf.time, existing) {
                self.write_value(value_id, leaf.value.clone(), &leaf.time);
            }
        }
    }

    /// Write unstamped leaves wherever nothing has been written yet.
    fn fill_defaults(&mut self, content: &Content) {
        for (table_id, rows) in &content.tables {
            for (row_id, cells) in rows {
                for (cell_id, value) in cells {
                    if self.cell_leaf(table_id, row_id, cell_id).is_none() {
                        self.write_cell(table_id, row_id, cell_id, Some(value.clone()), "");
                    }
                }
            }
        }
        for (value_id, value) in &content.values {
            if self.value_leaf(value_id).is_none() {
                self.write_value(value_id, Some(value.clone()), "");
            }
        }
    }

    fn value_leaf(&self, id: &str) -> Option<&Stamped<Option<Value>>> {
        self.content.values.value.get(id)
    }

    fn cell_leaf(&self, table: &str, row: &str, cell: &str) -> Option<&Stamped<Option<Value>>> {
        self.content
            .tables
            .value
            .get(table)?
            .value
            .get(row)?
            .value
            .get(cell)
    }

    fn live_value(&self, id: &str) -> Option<&Value> {
        self.value_leaf(id).and_then(|leaf| leaf.value.as_ref())
    }

    fn live_cell(&self, table: &str, row: &str, cell: &str) -> Option<&Value> {
        self.cell_leaf(table, row, cell)
            .and_then(|leaf| leaf.value.as_ref())
    }

    fn write_value(&mut self, id: &str, value: Option<Value>, time: &str) {
        let values = &mut self.content.values;
        bump(&mut values.time, time);
        let old = values
            .value
            .insert(id.to_string(), Stamped::new(value.clone(), time))
            .and_then(|leaf| leaf.value);

        if old != value {
            self.changes.values.insert(id.to_string(), value.clone());
        }
        let recorded = &mut self.mergeable.values;
        bump(&mut recorded.time, time);
        recorded
            .value
            .insert(id.to_string(), Stamped::new(value, time));
    }

    fn write_cell(&mut self, table: &str, row: &str, cell: &str, value: Option<Value>, time: &str) {
        let tables = &mut self.content.tables;
        bump(&mut tables.time, time);
        let rows = tables.value.entry(table.to_string()).or_default();
        bump(&mut rows.time, time);
        let cells = rows.value.entry(row.to_string()).or_default();
        bump(&mut cells.time, time);
        let old = cells
            .value
            .insert(cell.to_string(), Stamped::new(value.clone(), time))
            .and_then(|leaf| leaf.value);

        if old != value {
            self.changes
                .tables
                .entry(table.to_string())
                .or_insert_with(|| Some(TableChanges::new()))
                .get_or_insert_with(TableChanges::new)
                .entry(row.to_string())
                .or_insert_with(|| Some(RowChanges::new()))
                .get_or_insert_with(RowChanges::new)
                .insert(cell.to_string(), value.clone());
        }

        let tables = &mut self.mergeable.tables;
        bump(&mut tables.time, time);
        let rows = tables.value.entry(table.to_string()).or_default();
        bump(&mut rows.time, time);
        let cells = rows.value.entry(row.to_string()).or_default();
        bump(&mut cells.time, time);
        cells
            .value
            .insert(cell.to_string(), Stamped::new(value, time));
    }

    fn finish(mut self) -> (Changes, MergeableChanges) {
        bump(&mut self.mergeable.tables.time, &self.time);
        bump(&mut self.mergeable.values.time, &self.time);
        (self.changes, self.mergeable)
    }
}

fn bump(stamp: &mut String, time: &str) {
    if time > stamp.as_str() {
        *stamp = time.to_string();
    }
}

fn is_newer(incoming: &str, existing: Option<&str>) -> bool {
    existing.map_or(true, |existing| incoming > existing)
}

/// Plain changes turning `before` into `after`.
fn diff(before: &Content, after: &Content) -> Changes {
    let mut changes = Changes::new();
    for (table_id, rows) in &before.tables {
        for (row_id, cells) in rows {
            for cell_id in cells.keys() {
                let gone = after
                    .tables
                    .get(table_id)
                    .and_then(|rows| rows.get(row_id))
                    .map_or(true, |cells| !cells.contains_key(cell_id));
                if gone {
                    record_cell(&mut changes, table_id, row_id, cell_id, None);
                }
            }
        }
    }
    for (table_id, rows) in &after.tables {
        for (row_id, cells) in rows {
            for (cell_id, value) in cells {
                let previous = before
                    .tables
                    .get(table_id)
                    .and_then(|rows| rows.get(row_id))
                    .and_then(|cells| cells.get(cell_id));
                if previous != Some(value) {
                    record_cell(&mut changes, table_id, row_id, cell_id, Some(value.clone()));
                }
            }
        }
    }
    for value_id in before.values.keys() {
        if !after.values.contains_key(value_id) {
            changes.values.insert(value_id.clone(), None);
        }
    }
    for (value_id, value) in &after.values {
        if before.values.get(value_id) != Some(value) {
            changes.values.insert(value_id.clone(), Some(value.clone()));
        }
    }
    changes
}

fn record_cell(changes: &mut Changes, table: &str, row: &str, cell: &str, value: Option<Value>) {
    changes
        .tables
        .entry(table.to_string())
        .or_insert_with(|| Some(TableChanges::new()))
        .get_or_insert_with(TableChanges::new)
        .entry(row.to_string())
        .or_insert_with(|| Some(RowChanges::new()))
        .get_or_insert_with(RowChanges::new)
        .insert(cell.to_string(), value);
}
