use crate::error::{Error, Result};
use crate::{
    Catalog, Definition, ForeignKeyChild, ForeignKeyDef, RoutineDef, RoutineKey,
    RoutineTable, TableDef, TableKey, TableSpec, TriggerDef, ViewDef,
};
use fnv::FnvHashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use smol_str::SmolStr;
use std::sync::Arc;

/// In-memory catalog.
///
/// Besides lookup, it offers DDL operations and failure injection
/// (corruption, missing definitions) so that callers can exercise
/// their recovery paths.
#[derive(Debug, Default)]
pub struct MemCatalog {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    schemas: IndexSet<SmolStr>,
    tables: IndexMap<TableKey, TableEntry>,
    views: IndexMap<TableKey, ViewDef>,
    routines: IndexMap<RoutineKey, RoutineDef>,
    loads: FnvHashMap<TableKey, usize>,
    version_gen: u64,
}

#[derive(Debug)]
struct TableEntry {
    def: TableDef,
    state: TableState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Normal,
    /// Definition is unreadable. If not repairable, repair completes
    /// but the table stays corrupted.
    Corrupt { repairable: bool },
    /// Storage engine has the table but definition is missing.
    Undiscovered { discoverable: bool },
}

impl Inner {
    #[inline]
    fn next_version(&mut self) -> u64 {
        self.version_gen += 1;
        self.version_gen
    }

    #[inline]
    fn check_schema(&self, schema_name: &str) -> Result<()> {
        if self.schemas.contains(schema_name) {
            Ok(())
        } else {
            Err(Error::SchemaNotExists(SmolStr::new(schema_name)))
        }
    }

    #[inline]
    fn exists_object(&self, key: &TableKey) -> bool {
        self.tables.contains_key(key) || self.views.contains_key(key)
    }

    #[inline]
    fn table_mut(&mut self, key: &TableKey) -> Result<&mut TableEntry> {
        self.tables
            .get_mut(key)
            .ok_or_else(|| Error::TableNotExists(key.qualified()))
    }
}

impl MemCatalog {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_schema(&self, schema_name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.schemas.insert(SmolStr::new(schema_name)) {
            return Err(Error::SchemaAlreadyExists(SmolStr::new(schema_name)));
        }
        Ok(())
    }

    #[inline]
    pub fn exists_schema(&self, schema_name: &str) -> bool {
        self.inner.read().schemas.contains(schema_name)
    }

    #[inline]
    pub fn exists_table(&self, schema_name: &str, table_name: &str) -> bool {
        let key = TableKey::new(schema_name, table_name);
        self.inner.read().tables.contains_key(&key)
    }

    /// Create a table and returns its initial version.
    pub fn create_table(&self, table_spec: TableSpec) -> Result<u64> {
        let mut inner = self.inner.write();
        inner.check_schema(&table_spec.schema_name)?;
        let key = TableKey::new(&table_spec.schema_name, &table_spec.table_name);
        if inner.exists_object(&key) {
            return Err(Error::TableAlreadyExists(key.qualified()));
        }
        for (i, c) in table_spec.columns.iter().enumerate() {
            if table_spec.columns[..i].iter().any(|p| p.name == c.name) {
                return Err(Error::ColumnNameNotUnique(c.name.clone()));
            }
        }
        let version = inner.next_version();
        let def = TableDef {
            schema: table_spec.schema_name,
            name: table_spec.table_name,
            version,
            engine: table_spec.engine,
            columns: table_spec.columns,
            keys: vec![],
            triggers: vec![],
            foreign_keys: vec![],
            referenced_by: vec![],
        };
        inner.tables.insert(
            key,
            TableEntry {
                def,
                state: TableState::Normal,
            },
        );
        Ok(version)
    }

    /// Apply a change to table definition and bump its version.
    pub fn alter_table<F>(&self, schema_name: &str, table_name: &str, f: F) -> Result<u64>
    where
        F: FnOnce(&mut TableDef),
    {
        let mut inner = self.inner.write();
        let key = TableKey::new(schema_name, table_name);
        let version = inner.next_version();
        let entry = inner.table_mut(&key)?;
        f(&mut entry.def);
        entry.def.version = version;
        Ok(version)
    }

    pub fn drop_table(&self, schema_name: &str, table_name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let key = TableKey::new(schema_name, table_name);
        match inner.tables.shift_remove(&key) {
            Some(_) => Ok(()),
            None => Err(Error::TableNotExists(key.qualified())),
        }
    }

    pub fn add_trigger(
        &self,
        schema_name: &str,
        table_name: &str,
        trigger: TriggerDef,
    ) -> Result<u64> {
        self.alter_table(schema_name, table_name, |def| def.triggers.push(trigger))
    }

    /// Declare a foreign key on child table. Parent must exist.
    /// Both tables get a new version, as reverse edges of the parent
    /// are part of its definition.
    pub fn add_foreign_key(
        &self,
        schema_name: &str,
        table_name: &str,
        fk: ForeignKeyDef,
    ) -> Result<u64> {
        let mut inner = self.inner.write();
        let parent = TableKey::new(&fk.parent_schema, &fk.parent_table);
        if !inner.tables.contains_key(&parent) {
            return Err(Error::TableNotExists(parent.qualified()));
        }
        let child = TableKey::new(schema_name, table_name);
        inner.table_mut(&child)?;
        if parent != child {
            let parent_version = inner.next_version();
            inner.table_mut(&parent)?.def.version = parent_version;
        }
        let version = inner.next_version();
        let entry = inner.table_mut(&child)?;
        entry.def.foreign_keys.push(fk);
        entry.def.version = version;
        Ok(version)
    }

    pub fn create_view(
        &self,
        schema_name: &str,
        view_name: &str,
        tables: Vec<RoutineTable>,
        routines: Vec<RoutineKey>,
    ) -> Result<u64> {
        let mut inner = self.inner.write();
        inner.check_schema(schema_name)?;
        let key = TableKey::new(schema_name, view_name);
        if inner.exists_object(&key) {
            return Err(Error::TableAlreadyExists(key.qualified()));
        }
        let version = inner.next_version();
        let view = ViewDef {
            schema: SmolStr::new(schema_name),
            name: SmolStr::new(view_name),
            version,
            tables,
            routines,
        };
        inner.views.insert(key, view);
        Ok(version)
    }

    pub fn create_routine(&self, routine: RoutineDef) -> Result<()> {
        let mut inner = self.inner.write();
        inner.check_schema(&routine.key.schema)?;
        inner.routines.insert(routine.key.clone(), routine);
        Ok(())
    }

    /// Make the table definition unreadable.
    pub fn mark_corrupt(&self, schema_name: &str, table_name: &str, repairable: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.table_mut(&TableKey::new(schema_name, table_name))?;
        entry.state = TableState::Corrupt { repairable };
        Ok(())
    }

    /// Drop the cached definition, leaving the table only in storage engine.
    pub fn hide_for_discovery(
        &self,
        schema_name: &str,
        table_name: &str,
        discoverable: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.table_mut(&TableKey::new(schema_name, table_name))?;
        entry.state = TableState::Undiscovered { discoverable };
        Ok(())
    }

    /// Returns how many times definition of given table was loaded.
    #[inline]
    pub fn load_count(&self, schema_name: &str, table_name: &str) -> usize {
        let key = TableKey::new(schema_name, table_name);
        self.inner.read().loads.get(&key).cloned().unwrap_or_default()
    }

    #[inline]
    pub fn table_version(&self, schema_name: &str, table_name: &str) -> Option<u64> {
        let key = TableKey::new(schema_name, table_name);
        self.inner.read().tables.get(&key).map(|e| e.def.version)
    }
}

impl Catalog for MemCatalog {
    fn load_definition(&self, key: &TableKey) -> Result<Definition> {
        let mut inner = self.inner.write();
        *inner.loads.entry(key.clone()).or_default() += 1;
        if let Some(view) = inner.views.get(key) {
            return Ok(Definition::View(Arc::new(view.clone())));
        }
        let entry = match inner.tables.get(key) {
            Some(entry) => entry,
            None => return Err(Error::TableNotExists(key.qualified())),
        };
        match entry.state {
            TableState::Normal => (),
            TableState::Corrupt { .. } => return Err(Error::TableCorrupt(key.qualified())),
            TableState::Undiscovered { .. } => {
                return Err(Error::NeedsDiscovery(key.qualified()))
            }
        }
        let mut def = entry.def.clone();
        // reverse edges of foreign keys are derived at load time.
        def.referenced_by = inner
            .tables
            .values()
            .flat_map(|child| {
                child
                    .def
                    .foreign_keys
                    .iter()
                    .filter(|fk| fk.parent_schema == def.schema && fk.parent_table == def.name)
                    .map(move |fk| ForeignKeyChild {
                        name: fk.name.clone(),
                        child_schema: child.def.schema.clone(),
                        child_table: child.def.name.clone(),
                        on_update: fk.on_update,
                        on_delete: fk.on_delete,
                    })
            })
            .collect();
        Ok(Definition::Table(Arc::new(def)))
    }

    fn load_routine(&self, key: &RoutineKey) -> Result<RoutineDef> {
        let inner = self.inner.read();
        inner
            .routines
            .get(key)
            .cloned()
            .ok_or_else(|| Error::RoutineNotExists(key.qualified()))
    }

    fn discover(&self, key: &TableKey) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.table_mut(key)?;
        match entry.state {
            TableState::Undiscovered { discoverable: true } => {
                entry.state = TableState::Normal;
                Ok(())
            }
            TableState::Undiscovered {
                discoverable: false,
            } => Err(Error::DiscoveryFailed(key.qualified())),
            _ => Ok(()),
        }
    }

    fn repair(&self, key: &TableKey) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner.table_mut(key)?;
        if let TableState::Corrupt { repairable: true } = entry.state {
            entry.state = TableState::Normal;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;
    use crate::{ColumnAttr, ColumnDef, FkAction, TableAccess, TriggerEvent, TriggerTiming};

    fn catalog() -> MemCatalog {
        let cata = MemCatalog::new();
        cata.create_schema("db1").unwrap();
        let cols = vec![
            ColumnDef::new("id", DataType::I64, ColumnAttr::PK),
            ColumnDef::new("v", DataType::String, ColumnAttr::NULLABLE),
        ];
        cata.create_table(TableSpec::new("db1", "t1", cols.clone()))
            .unwrap();
        cata.create_table(TableSpec::new("db1", "t2", cols)).unwrap();
        cata
    }

    #[test]
    fn test_mem_catalog_create_and_load() {
        let cata = catalog();
        assert!(cata.exists_table("db1", "t1"));
        let def = cata.load_definition(&TableKey::new("db1", "t1")).unwrap();
        let t = def.as_table().unwrap();
        assert_eq!(t.columns.len(), 2);
        assert_eq!(cata.load_count("db1", "t1"), 1);
        assert!(matches!(
            cata.create_table(TableSpec::new("db1", "t1", vec![])),
            Err(Error::TableAlreadyExists(_))
        ));
        assert!(matches!(
            cata.create_table(TableSpec::new("db2", "t1", vec![])),
            Err(Error::SchemaNotExists(_))
        ));
        let dup = vec![
            ColumnDef::new("c", DataType::I32, ColumnAttr::empty()),
            ColumnDef::new("c", DataType::I32, ColumnAttr::empty()),
        ];
        assert!(matches!(
            cata.create_table(TableSpec::new("db1", "t3", dup)),
            Err(Error::ColumnNameNotUnique(_))
        ));
        assert!(matches!(
            cata.load_definition(&TableKey::new("db1", "t9")),
            Err(Error::TableNotExists(_))
        ));
    }

    #[test]
    fn test_mem_catalog_alter_bumps_version() {
        let cata = catalog();
        let v1 = cata.table_version("db1", "t1").unwrap();
        let v2 = cata
            .alter_table("db1", "t1", |def| {
                def.columns
                    .push(ColumnDef::new("c2", DataType::Bool, ColumnAttr::empty()))
            })
            .unwrap();
        assert!(v2 > v1);
        let def = cata.load_definition(&TableKey::new("db1", "t1")).unwrap();
        assert_eq!(def.version(), v2);
    }

    #[test]
    fn test_mem_catalog_triggers_and_foreign_keys() {
        let cata = catalog();
        cata.add_trigger(
            "db1",
            "t1",
            TriggerDef {
                name: SmolStr::new("trg1"),
                event: TriggerEvent::Insert,
                timing: TriggerTiming::After,
                tables: vec![RoutineTable::new("db1", "t2", TableAccess::Write)],
                routines: vec![],
            },
        )
        .unwrap();
        let parent_v1 = cata.table_version("db1", "t1").unwrap();
        cata.add_foreign_key(
            "db1",
            "t2",
            ForeignKeyDef {
                name: SmolStr::new("fk1"),
                parent_schema: SmolStr::new("db1"),
                parent_table: SmolStr::new("t1"),
                on_update: FkAction::Cascade,
                on_delete: FkAction::Restrict,
            },
        )
        .unwrap();
        let def = cata.load_definition(&TableKey::new("db1", "t1")).unwrap();
        let t1 = def.as_table().unwrap();
        assert_eq!(t1.triggers_for(TriggerEvent::Insert).count(), 1);
        assert_eq!(t1.triggers_for(TriggerEvent::Delete).count(), 0);
        assert_eq!(t1.referenced_by.len(), 1);
        assert_eq!(t1.referenced_by[0].child_table, "t2");
        // parent definition changed with the new reverse edge
        assert!(t1.version > parent_v1);
        assert!(matches!(
            cata.add_foreign_key(
                "db1",
                "t9",
                ForeignKeyDef {
                    name: SmolStr::new("fk2"),
                    parent_schema: SmolStr::new("db1"),
                    parent_table: SmolStr::new("t1"),
                    on_update: FkAction::NoAction,
                    on_delete: FkAction::NoAction,
                },
            ),
            Err(Error::TableNotExists(_))
        ));
        assert_eq!(cata.table_version("db1", "t1"), Some(t1.version));
    }

    #[test]
    fn test_mem_catalog_failure_injection() {
        let cata = catalog();
        let k1 = TableKey::new("db1", "t1");
        cata.mark_corrupt("db1", "t1", true).unwrap();
        assert!(matches!(
            cata.load_definition(&k1),
            Err(Error::TableCorrupt(_))
        ));
        cata.repair(&k1).unwrap();
        assert!(cata.load_definition(&k1).is_ok());

        let k2 = TableKey::new("db1", "t2");
        cata.hide_for_discovery("db1", "t2", false).unwrap();
        assert!(matches!(
            cata.load_definition(&k2),
            Err(Error::NeedsDiscovery(_))
        ));
        assert!(matches!(cata.discover(&k2), Err(Error::DiscoveryFailed(_))));
        cata.hide_for_discovery("db1", "t2", true).unwrap();
        cata.discover(&k2).unwrap();
        assert!(cata.load_definition(&k2).is_ok());
    }

    #[test]
    fn test_mem_catalog_views_and_routines() {
        let cata = catalog();
        cata.create_view(
            "db1",
            "v1",
            vec![RoutineTable::new("db1", "t1", TableAccess::Read)],
            vec![],
        )
        .unwrap();
        let def = cata.load_definition(&TableKey::new("db1", "v1")).unwrap();
        assert!(def.is_view());
        let key = RoutineKey::function("db1", "f1");
        assert!(matches!(
            cata.load_routine(&key),
            Err(Error::RoutineNotExists(_))
        ));
        cata.create_routine(RoutineDef {
            key: key.clone(),
            tables: vec![],
            routines: vec![],
        })
        .unwrap();
        assert_eq!(cata.load_routine(&key).unwrap().key, key);
    }
}
