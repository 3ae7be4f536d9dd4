use crate::error::Result;
use crate::table_list::{DescId, LockType, PrelockSource, TableDesc, TableList, TriggerEvents};
use xngin_catalog::{FkAction, RoutineDef, RoutineKey, RoutineTable, TableAccess, TableDef, ViewDef};
use xngin_mdl::MdlType;

/// What a strategy pulls into the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrelockPolicy {
    /// Tables and routines used by triggers.
    pub triggers: bool,
    /// Parent and child tables of foreign keys.
    pub foreign_keys: bool,
    /// Tables and routines used by routines.
    pub routines: bool,
    /// Base tables and routines of views.
    pub views: bool,
    /// Request strongest lock instead of the one asked by the statement.
    pub force_strong_lock: bool,
}

/// Decides which dependent objects must be opened and locked together
/// with a statement's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrelockingStrategy {
    /// Ordinary statements.
    Dml,
    /// LOCK TABLES: locks are kept for the following statements.
    LockTables,
    /// DDL never runs trigger or view bodies.
    AlterTable,
}

impl PrelockingStrategy {
    #[inline]
    pub const fn policy(self) -> PrelockPolicy {
        match self {
            PrelockingStrategy::Dml => PrelockPolicy {
                triggers: true,
                foreign_keys: true,
                routines: true,
                views: true,
                force_strong_lock: false,
            },
            PrelockingStrategy::LockTables => PrelockPolicy {
                triggers: true,
                foreign_keys: true,
                routines: true,
                views: true,
                force_strong_lock: true,
            },
            PrelockingStrategy::AlterTable => PrelockPolicy {
                triggers: false,
                foreign_keys: false,
                routines: false,
                views: false,
                force_strong_lock: false,
            },
        }
    }

    /// Metadata lock type to request for the descriptor.
    #[inline]
    pub fn mdl_type(self, desc: &TableDesc) -> MdlType {
        if !self.policy().force_strong_lock {
            return desc.mdl_type;
        }
        if desc.lock.is_write() {
            MdlType::SharedNoReadWrite
        } else {
            MdlType::SharedNoWrite
        }
    }

    /// Extend the list with objects required by an opened table.
    /// Returns true if anything was added.
    pub fn handle_table(self, list: &mut TableList, id: DescId, def: &TableDef) -> Result<bool> {
        let policy = self.policy();
        let desc = list.desc(id);
        let (lock, events, optional) = (desc.lock, desc.trigger_events, desc.optional);
        let mut added = false;
        if policy.triggers {
            for event in events.events() {
                for trg in def.triggers_for(event) {
                    let source = PrelockSource::Trigger { table: id, event };
                    added |= add_tables(list, &trg.tables, &source);
                    for r in &trg.routines {
                        added |= list.add_routine(r.clone(), Some(source.clone()), optional);
                    }
                }
            }
        }
        if policy.foreign_keys && lock.is_write() {
            for fk in &def.foreign_keys {
                added |= list
                    .add_prelocked_table(
                        &fk.parent_schema,
                        &fk.parent_table,
                        LockType::Read,
                        TriggerEvents::empty(),
                        PrelockSource::ForeignKey(id),
                    )
                    .is_some();
            }
            if events.intersects(TriggerEvents::UPDATE | TriggerEvents::DELETE) {
                for child in &def.referenced_by {
                    let mut child_events = TriggerEvents::empty();
                    if events.contains(TriggerEvents::UPDATE) {
                        child_events |= cascaded_events(child.on_update, TriggerEvents::UPDATE);
                    }
                    if events.contains(TriggerEvents::DELETE) {
                        child_events |= cascaded_events(child.on_delete, TriggerEvents::DELETE);
                    }
                    added |= list
                        .add_prelocked_table(
                            &child.child_schema,
                            &child.child_table,
                            LockType::Write,
                            child_events,
                            PrelockSource::ForeignKey(id),
                        )
                        .is_some();
                }
            }
        }
        Ok(added)
    }

    /// Extend the list with base tables and routines of an opened view.
    pub fn handle_view(self, list: &mut TableList, id: DescId, view: &ViewDef) -> Result<bool> {
        if !self.policy().views {
            return Ok(false);
        }
        let desc = list.desc(id);
        let (lock, events, optional) = (desc.lock, desc.trigger_events, desc.optional);
        let mut added = false;
        for t in &view.tables {
            let base = list.add_view_table(id, &t.schema, &t.name, lock);
            list.desc_mut(base).trigger_events = events;
            added = true;
        }
        for r in &view.routines {
            added |= list.add_routine(r.clone(), Some(PrelockSource::View(id)), optional);
        }
        Ok(added)
    }

    /// Extend the list with tables and routines used by a routine.
    /// Routines already in the statement are not added again, which
    /// stops recursion through cyclic calls.
    pub fn handle_routine(
        self,
        list: &mut TableList,
        key: &RoutineKey,
        def: &RoutineDef,
    ) -> Result<bool> {
        if !self.policy().routines {
            return Ok(false);
        }
        // callees of a routine which may be absent may be absent too
        let optional = list
            .routines()
            .get(key)
            .map(|e| e.optional)
            .unwrap_or_default();
        let source = PrelockSource::Routine(key.clone());
        let mut added = add_tables(list, &def.tables, &source);
        for r in &def.routines {
            added |= list.add_routine(r.clone(), Some(source.clone()), optional);
        }
        Ok(added)
    }
}

#[inline]
fn add_tables(list: &mut TableList, tables: &[RoutineTable], source: &PrelockSource) -> bool {
    let mut added = false;
    for t in tables {
        let (lock, events) = match t.access {
            TableAccess::Read => (LockType::Read, TriggerEvents::empty()),
            TableAccess::Write => (LockType::Write, TriggerEvents::all()),
        };
        added |= list
            .add_prelocked_table(&t.schema, &t.name, lock, events, source.clone())
            .is_some();
    }
    added
}

/// Events fired on child rows by a referential action.
#[inline]
fn cascaded_events(action: FkAction, event: TriggerEvents) -> TriggerEvents {
    match action {
        FkAction::Cascade => event,
        FkAction::SetNull => TriggerEvents::UPDATE,
        FkAction::NoAction | FkAction::Restrict => TriggerEvents::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol_str::SmolStr;
    use xngin_catalog::{
        ForeignKeyChild, ForeignKeyDef, TriggerDef, TriggerEvent, TriggerTiming,
    };

    fn table_def(name: &str) -> TableDef {
        TableDef {
            schema: SmolStr::new("db"),
            name: SmolStr::new(name),
            version: 1,
            engine: SmolStr::new("innodb"),
            columns: vec![],
            keys: vec![],
            triggers: vec![],
            foreign_keys: vec![],
            referenced_by: vec![],
        }
    }

    fn audit_trigger() -> TriggerDef {
        TriggerDef {
            name: SmolStr::new("trg_orders_ins"),
            event: TriggerEvent::Insert,
            timing: TriggerTiming::After,
            tables: vec![RoutineTable::new("db", "audit_log", TableAccess::Write)],
            routines: vec![RoutineKey::function("db", "f_audit")],
        }
    }

    #[test]
    fn test_dml_adds_trigger_tables() {
        let mut def = table_def("orders");
        def.triggers.push(audit_trigger());
        let mut list = TableList::new();
        let id = list.add_table("db", "orders", None, LockType::Read);
        // no insert event, trigger not involved
        assert!(!PrelockingStrategy::Dml.handle_table(&mut list, id, &def).unwrap());
        list.desc_mut(id).trigger_events = TriggerEvents::INSERT;
        assert!(PrelockingStrategy::Dml.handle_table(&mut list, id, &def).unwrap());
        assert_eq!(list.global_names(), vec!["orders", "audit_log"]);
        assert!(list
            .routines()
            .contains_key(&RoutineKey::function("db", "f_audit")));
        // fixed point reached
        assert!(!PrelockingStrategy::Dml.handle_table(&mut list, id, &def).unwrap());
        assert!(!PrelockingStrategy::AlterTable
            .handle_table(&mut list, id, &def)
            .unwrap());
    }

    #[test]
    fn test_dml_adds_foreign_key_tables() {
        let mut def = table_def("orders");
        def.foreign_keys.push(ForeignKeyDef {
            name: SmolStr::new("fk_user"),
            parent_schema: SmolStr::new("db"),
            parent_table: SmolStr::new("users"),
            on_update: FkAction::NoAction,
            on_delete: FkAction::NoAction,
        });
        def.referenced_by.push(ForeignKeyChild {
            name: SmolStr::new("fk_order"),
            child_schema: SmolStr::new("db"),
            child_table: SmolStr::new("order_items"),
            on_update: FkAction::NoAction,
            on_delete: FkAction::Cascade,
        });
        let mut list = TableList::new();
        let id = list.add_table("db", "orders", None, LockType::Read);
        assert!(!PrelockingStrategy::Dml.handle_table(&mut list, id, &def).unwrap());

        let mut list = TableList::new();
        let id = list.add_table("db", "orders", None, LockType::Write);
        list.desc_mut(id).trigger_events = TriggerEvents::INSERT;
        assert!(PrelockingStrategy::Dml.handle_table(&mut list, id, &def).unwrap());
        assert_eq!(list.global_names(), vec!["orders", "users"]);

        let mut list = TableList::new();
        let id = list.add_table("db", "orders", None, LockType::Write);
        list.desc_mut(id).trigger_events = TriggerEvents::DELETE;
        assert!(PrelockingStrategy::Dml.handle_table(&mut list, id, &def).unwrap());
        assert_eq!(list.global_names(), vec!["orders", "users", "order_items"]);
        let child = list.find_table_in_global_list("db", "order_items").unwrap();
        let child = list.desc(child);
        assert_eq!(child.lock, LockType::Write);
        assert_eq!(child.trigger_events, TriggerEvents::DELETE);
        assert_eq!(child.prelocking_placeholder, Some(PrelockSource::ForeignKey(id)));
    }

    #[test]
    fn test_routine_cycle_terminates() {
        let p1 = RoutineKey::procedure("db", "p1");
        let p2 = RoutineKey::procedure("db", "p2");
        let d1 = RoutineDef {
            key: p1.clone(),
            tables: vec![RoutineTable::new("db", "t1", TableAccess::Read)],
            routines: vec![p2.clone()],
        };
        let d2 = RoutineDef {
            key: p2.clone(),
            tables: vec![RoutineTable::new("db", "t2", TableAccess::Write)],
            routines: vec![p1.clone()],
        };
        let mut list = TableList::new();
        list.add_routine(p1.clone(), None, false);
        let strategy = PrelockingStrategy::Dml;
        // work-list over routines until no new routine appears
        let mut i = 0;
        while i < list.routines().len() {
            let key = list.routines().get_index(i).map(|(k, _)| k.clone()).unwrap();
            let def = if key == p1 { &d1 } else { &d2 };
            strategy.handle_routine(&mut list, &key, def).unwrap();
            i += 1;
        }
        assert_eq!(list.routines().len(), 2);
        assert_eq!(list.global_names(), vec!["t1", "t2"]);
        assert!(!list.routines()[&p2].optional);
    }

    #[test]
    fn test_callee_of_optional_routine_is_optional() {
        let p1 = RoutineKey::procedure("db", "p1");
        let p2 = RoutineKey::procedure("db", "p2");
        let d1 = RoutineDef {
            key: p1.clone(),
            tables: vec![],
            routines: vec![p2.clone()],
        };
        let mut list = TableList::new();
        list.add_routine(p1.clone(), None, true);
        assert!(PrelockingStrategy::Dml
            .handle_routine(&mut list, &p1, &d1)
            .unwrap());
        let entry = &list.routines()[&p2];
        assert!(entry.optional);
        assert_eq!(entry.parent, Some(PrelockSource::Routine(p1)));
    }

    #[test]
    fn test_view_and_lock_tables() {
        let view = ViewDef {
            schema: SmolStr::new("db"),
            name: SmolStr::new("v1"),
            version: 1,
            tables: vec![
                RoutineTable::new("db", "t1", TableAccess::Read),
                RoutineTable::new("db", "t2", TableAccess::Read),
            ],
            routines: vec![],
        };
        let mut list = TableList::new();
        let v = list.add_table("db", "v1", None, LockType::Write);
        assert!(!PrelockingStrategy::AlterTable
            .handle_view(&mut list, v, &view)
            .unwrap());
        assert!(PrelockingStrategy::LockTables
            .handle_view(&mut list, v, &view)
            .unwrap());
        assert_eq!(list.global_names(), vec!["v1", "t1", "t2"]);
        assert_eq!(list.local().len(), 1);
        let t1 = list.find_table_in_global_list("db", "t1").unwrap();
        assert_eq!(list.desc(t1).belong_to_view, Some(v));
        let strategy = PrelockingStrategy::LockTables;
        assert_eq!(strategy.mdl_type(list.desc(t1)), MdlType::SharedNoReadWrite);
        let r = list.add_table("db", "t3", None, LockType::Read);
        assert_eq!(strategy.mdl_type(list.desc(r)), MdlType::SharedNoWrite);
        assert_eq!(
            PrelockingStrategy::Dml.mdl_type(list.desc(r)),
            MdlType::SharedRead
        );
    }
}
