pub mod error;
pub mod mem_impl;
pub mod types;

use crate::error::Result;
use crate::types::DataType;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;

/// Catalog is the source of truth of table, view and routine definitions.
/// Caches above it only copy definitions out and never write back.
/// It could be shared between threads.
pub trait Catalog: Send + Sync {
    /// Load definition of a table or view.
    ///
    /// Fails with `TableNotExists` if the object is absent, `NeedsDiscovery`
    /// if storage engine owns the table but the definition must be
    /// rediscovered, and `TableCorrupt` if the definition is unreadable.
    fn load_definition(&self, key: &TableKey) -> Result<Definition>;

    /// Load definition of a stored routine.
    fn load_routine(&self, key: &RoutineKey) -> Result<RoutineDef>;

    /// Materialize a missing table definition from storage engine.
    fn discover(&self, key: &TableKey) -> Result<()>;

    /// Repair a corrupted table.
    fn repair(&self, key: &TableKey) -> Result<()>;
}

/// TableKey is the byte-exact identity of a table in caches.
///
/// Layout: `len(schema) u32 LE | schema | len(name) u32 LE | name`.
/// The length prefixes make the encoding unambiguous, e.g.
/// ("a.b", "c") and ("a", "b.c") are different keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableKey(SmallVec<[u8; 64]>);

impl TableKey {
    #[inline]
    pub fn new(schema: &str, name: &str) -> Self {
        let mut bytes = SmallVec::with_capacity(8 + schema.len() + name.len());
        bytes.extend_from_slice(&(schema.len() as u32).to_le_bytes());
        bytes.extend_from_slice(schema.as_bytes());
        bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
        bytes.extend_from_slice(name.as_bytes());
        TableKey(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    fn schema_len(&self) -> usize {
        let b = &self.0;
        u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
    }

    #[inline]
    pub fn schema(&self) -> &str {
        let len = self.schema_len();
        decode_str(&self.0[4..4 + len])
    }

    #[inline]
    pub fn name(&self) -> &str {
        let start = 4 + self.schema_len();
        decode_str(&self.0[start + 4..])
    }

    /// Returns "schema.name" for messages.
    #[inline]
    pub fn qualified(&self) -> SmolStr {
        SmolStr::new(format!("{}.{}", self.schema(), self.name()))
    }
}

/// Both parts of a key are copied from `&str`, so decoding never fails.
#[inline]
fn decode_str(bytes: &[u8]) -> &str {
    std::str::from_utf8(bytes).unwrap_or_default()
}

impl fmt::Debug for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableKey({}.{})", self.schema(), self.name())
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`.`{}`", self.schema(), self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoutineKind {
    Function,
    Procedure,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutineKey {
    pub kind: RoutineKind,
    pub schema: SmolStr,
    pub name: SmolStr,
}

impl RoutineKey {
    #[inline]
    pub fn function(schema: &str, name: &str) -> Self {
        RoutineKey {
            kind: RoutineKind::Function,
            schema: SmolStr::new(schema),
            name: SmolStr::new(name),
        }
    }

    #[inline]
    pub fn procedure(schema: &str, name: &str) -> Self {
        RoutineKey {
            kind: RoutineKind::Procedure,
            schema: SmolStr::new(schema),
            name: SmolStr::new(name),
        }
    }

    #[inline]
    pub fn qualified(&self) -> SmolStr {
        SmolStr::new(format!("{}.{}", self.schema, self.name))
    }
}

/// How a routine, trigger or view body accesses a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableAccess {
    Read,
    Write,
}

/// Table referenced from a routine, trigger or view body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineTable {
    pub schema: SmolStr,
    pub name: SmolStr,
    pub access: TableAccess,
}

impl RoutineTable {
    #[inline]
    pub fn new(schema: &str, name: &str, access: TableAccess) -> Self {
        RoutineTable {
            schema: SmolStr::new(schema),
            name: SmolStr::new(name),
            access,
        }
    }

    #[inline]
    pub fn key(&self) -> TableKey {
        TableKey::new(&self.schema, &self.name)
    }
}

bitflags! {
    pub struct ColumnAttr: u8 {
        const PK = 0x01; // primary key
        const UK = 0x02; // unique key
        const FK = 0x04; // foreign key
        const NULLABLE = 0x08;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: SmolStr,
    pub ty: DataType,
    pub attr: ColumnAttr,
}

impl ColumnDef {
    #[inline]
    pub fn new(name: &str, ty: DataType, attr: ColumnAttr) -> Self {
        ColumnDef {
            name: SmolStr::new(name),
            ty,
            attr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    pub name: SmolStr,
    pub unique: bool,
    /// Positions of key columns in column list.
    pub cols: SmallVec<[u16; 4]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerTiming {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDef {
    pub name: SmolStr,
    pub event: TriggerEvent,
    pub timing: TriggerTiming,
    pub tables: Vec<RoutineTable>,
    pub routines: Vec<RoutineKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FkAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
}

/// Foreign key declared on a child table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDef {
    pub name: SmolStr,
    pub parent_schema: SmolStr,
    pub parent_table: SmolStr,
    pub on_update: FkAction,
    pub on_delete: FkAction,
}

/// Reverse edge of a foreign key, seen from the parent table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyChild {
    pub name: SmolStr,
    pub child_schema: SmolStr,
    pub child_table: SmolStr,
    pub on_update: FkAction,
    pub on_delete: FkAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub schema: SmolStr,
    pub name: SmolStr,
    /// Incremented by every DDL on this table.
    pub version: u64,
    pub engine: SmolStr,
    pub columns: Vec<ColumnDef>,
    pub keys: Vec<KeyDef>,
    pub triggers: Vec<TriggerDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
    pub referenced_by: Vec<ForeignKeyChild>,
}

impl TableDef {
    /// Returns triggers fired by given event.
    #[inline]
    pub fn triggers_for(&self, event: TriggerEvent) -> impl Iterator<Item = &TriggerDef> {
        self.triggers.iter().filter(move |t| t.event == event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDef {
    pub schema: SmolStr,
    pub name: SmolStr,
    pub version: u64,
    pub tables: Vec<RoutineTable>,
    pub routines: Vec<RoutineKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutineDef {
    pub key: RoutineKey,
    pub tables: Vec<RoutineTable>,
    pub routines: Vec<RoutineKey>,
}

/// Definition loaded from catalog.
#[derive(Debug, Clone)]
pub enum Definition {
    Table(Arc<TableDef>),
    View(Arc<ViewDef>),
}

impl Definition {
    #[inline]
    pub fn version(&self) -> u64 {
        match self {
            Definition::Table(t) => t.version,
            Definition::View(v) => v.version,
        }
    }

    #[inline]
    pub fn is_view(&self) -> bool {
        matches!(self, Definition::View(_))
    }

    #[inline]
    pub fn as_table(&self) -> Option<&Arc<TableDef>> {
        match self {
            Definition::Table(t) => Some(t),
            Definition::View(_) => None,
        }
    }

    #[inline]
    pub fn as_view(&self) -> Option<&Arc<ViewDef>> {
        match self {
            Definition::View(v) => Some(v),
            Definition::Table(_) => None,
        }
    }
}

/// Table spec used in creating table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub schema_name: SmolStr,
    pub table_name: SmolStr,
    pub engine: SmolStr,
    pub columns: Vec<ColumnDef>,
}

impl TableSpec {
    #[inline]
    pub fn new(schema_name: &str, table_name: &str, columns: Vec<ColumnDef>) -> Self {
        TableSpec {
            schema_name: SmolStr::new(schema_name),
            table_name: SmolStr::new(table_name),
            engine: SmolStr::new("innodb"),
            columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_key_length_prefixed() {
        let k1 = TableKey::new("a.b", "c");
        let k2 = TableKey::new("a", "b.c");
        assert_ne!(k1, k2);
        assert_ne!(k1.as_bytes(), k2.as_bytes());
        assert_eq!(k1.schema(), "a.b");
        assert_eq!(k1.name(), "c");
        assert_eq!(k2.schema(), "a");
        assert_eq!(k2.name(), "b.c");
        assert_eq!(k1, TableKey::new("a.b", "c"));
    }

    #[test]
    fn test_table_key_byte_exact() {
        // no case folding in keys
        assert_ne!(TableKey::new("db", "T1"), TableKey::new("db", "t1"));
        let k = TableKey::new("", "");
        assert_eq!(k.as_bytes().len(), 8);
        assert_eq!(k.schema(), "");
        assert_eq!(k.name(), "");
        assert_eq!(format!("{}", TableKey::new("db", "t1")), "`db`.`t1`");
    }

    #[test]
    fn test_table_key_multibyte_names() {
        let k = TableKey::new("数据库", "表ü");
        assert_eq!(k.schema(), "数据库");
        assert_eq!(k.name(), "表ü");
        assert_eq!(k.qualified(), "数据库.表ü");
        assert_ne!(k, TableKey::new("数据", "库表ü"));
    }
}
