//! Store content and change-set types.
//!
//! A store holds *tables* (table id -> row id -> cell id -> value) and
//! *values* (value id -> value). Cells and values are arbitrary JSON.
//!
//! Change-sets use `Option` at every level: `None` means the table, row,
//! cell or value was deleted by the transaction.

use serde_json::Value;
use std::collections::BTreeMap;

/// Cells of a single row.
pub type Row = BTreeMap<String, Value>;
/// Rows of a single table.
pub type Table = BTreeMap<String, Row>;
/// All tables of a store.
pub type Tables = BTreeMap<String, Table>;
/// All keyed values of a store.
pub type Values = BTreeMap<String, Value>;

/// Changed cells of a row (`None` = cell deleted).
pub type RowChanges = BTreeMap<String, Option<Value>>;
/// Changed rows of a table (`None` = row deleted).
pub type TableChanges = BTreeMap<String, Option<RowChanges>>;
/// Changed tables (`None` = table deleted).
pub type TablesChanges = BTreeMap<String, Option<TableChanges>>;
/// Changed values (`None` = value deleted).
pub type ValuesChanges = BTreeMap<String, Option<Value>>;

/// Stamped leaves of a mergeable row, or the stamped values map.
///
/// A `None` leaf is a tombstone: the cell or value was deleted at `time`.
pub type MergeableCells = BTreeMap<String, Stamped<Option<Value>>>;
/// Stamped rows of a mergeable table.
pub type MergeableRows = BTreeMap<String, Stamped<MergeableCells>>;
/// Stamped tables of a mergeable store.
pub type MergeableTables = BTreeMap<String, Stamped<MergeableRows>>;
/// Stamped values of a mergeable store.
pub type MergeableValues = MergeableCells;

/// Full content of a plain store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Content {
    /// Table data.
    pub tables: Tables,
    /// Keyed values.
    pub values: Values,
}

impl Content {
    /// Create empty content.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create content from tables and values.
    pub fn from_parts(tables: Tables, values: Values) -> Self {
        Self { tables, values }
    }

    /// Set a single keyed value.
    pub fn with_value(mut self, id: &str, value: Value) -> Self {
        self.values.insert(id.to_string(), value);
        self
    }

    /// Set a single cell, creating the table and row as needed.
    pub fn with_cell(mut self, table: &str, row: &str, cell: &str, value: Value) -> Self {
        self.tables
            .entry(table.to_string())
            .or_default()
            .entry(row.to_string())
            .or_default()
            .insert(cell.to_string(), value);
        self
    }

    /// Check if there are neither tables nor values.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.values.is_empty()
    }
}

/// Changes made to a plain store by one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Changed tables.
    pub tables: TablesChanges,
    /// Changed values.
    pub values: ValuesChanges,
}

impl Changes {
    /// Create an empty change-set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the change-set touches nothing.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.values.is_empty()
    }
}

/// A value carrying the merge timestamp of its last change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stamped<T> {
    /// The stamped value.
    pub value: T,
    /// Opaque, lexically ordered timestamp. Empty means "never written".
    pub time: String,
}

impl<T> Stamped<T> {
    /// Stamp a value.
    pub fn new(value: T, time: impl Into<String>) -> Self {
        Self {
            value,
            time: time.into(),
        }
    }
}

/// Full content of a mergeable store, with merge stamps at every level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeableContent {
    /// Stamped table data.
    pub tables: Stamped<MergeableTables>,
    /// Stamped keyed values.
    pub values: Stamped<MergeableValues>,
}

impl MergeableContent {
    /// Strip merge metadata and tombstones, yielding plain content.
    pub fn to_content(&self) -> Content {
        let tables = self
            .tables
            .value
            .iter()
            .map(|(table_id, table)| {
                let rows = table
                    .value
                    .iter()
                    .map(|(row_id, row)| (row_id.clone(), live_leaves(&row.value)))
                    .filter(|(_, row)| !row.is_empty())
                    .collect::<Table>();
                (table_id.clone(), rows)
            })
            .filter(|(_, table)| !table.is_empty())
            .collect();
        Content {
            tables,
            values: live_leaves(&self.values.value),
        }
    }
}

/// Changes made to a mergeable store by one transaction.
///
/// Same shape as [`MergeableContent`], but holding only what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeableChanges {
    /// Stamped changed tables.
    pub tables: Stamped<MergeableTables>,
    /// Stamped changed values.
    pub values: Stamped<MergeableValues>,
}

impl MergeableChanges {
    /// Check whether the change-set touches nothing.
    pub fn is_empty(&self) -> bool {
        self.tables.value.is_empty() && self.values.value.is_empty()
    }
}

/// Content as read from a store, plain or mergeable depending on its binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreContent {
    /// Plain content.
    Plain(Content),
    /// Mergeable content.
    Mergeable(MergeableContent),
}

/// Transaction changes as read from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChanges {
    /// Plain change-set.
    Plain(Changes),
    /// Mergeable change-set.
    Mergeable(MergeableChanges),
}

impl StoreChanges {
    /// Emptiness test appropriate to the change-set's shape.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Plain(changes) => changes.is_empty(),
            Self::Mergeable(changes) => changes.is_empty(),
        }
    }
}

/// A payload held by (or notified from) a persistence medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persisted {
    /// Complete content, replacing whatever the store holds.
    Content(StoreContent),
    /// A change-set to apply on top of the store's content.
    Changes(StoreChanges),
}

impl Persisted {
    /// Check if the payload carries merge metadata.
    pub fn is_mergeable(&self) -> bool {
        matches!(
            self,
            Self::Content(StoreContent::Mergeable(_)) | Self::Changes(StoreChanges::Mergeable(_))
        )
    }
}

impl From<Content> for Persisted {
    fn from(content: Content) -> Self {
        Self::Content(StoreContent::Plain(content))
    }
}

impl From<Changes> for Persisted {
    fn from(changes: Changes) -> Self {
        Self::Changes(StoreChanges::Plain(changes))
    }
}

impl From<MergeableContent> for Persisted {
    fn from(content: MergeableContent) -> Self {
        Self::Content(StoreContent::Mergeable(content))
    }
}

impl From<MergeableChanges> for Persisted {
    fn from(changes: MergeableChanges) -> Self {
        Self::Changes(StoreChanges::Mergeable(changes))
    }
}

fn live_leaves(leaves: &MergeableCells) -> BTreeMap<String, Value> {
    leaves
        .iter()
        .filter_map(|(id, leaf)| leaf.value.clone().map(|value| (id.clone(), value)))
        .collect()
}
