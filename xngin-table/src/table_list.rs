use crate::error::{Error, Result};
use crate::handle::TableHandle;
use crate::tdc::ShareRef;
use bitflags::bitflags;
use fnv::FnvHashSet;
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::mem;
use xngin_catalog::{RoutineKey, TableKey, TriggerEvent};
use xngin_mdl::{MdlKey, MdlTicket, MdlType};

/// Index of a descriptor in its table list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescId(u32);

impl DescId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a join nest in its table list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NestId(u32);

/// Table lock requested by the statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    ReadNoInsert,
    Write,
    WriteLowPriority,
}

impl LockType {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, LockType::Write | LockType::WriteLowPriority)
    }

    /// Metadata lock used to access data with this lock.
    #[inline]
    pub fn mdl_type(self) -> MdlType {
        if self.is_write() {
            MdlType::SharedWrite
        } else {
            MdlType::SharedRead
        }
    }
}

bitflags! {
    /// Trigger events a statement fires on a table.
    pub struct TriggerEvents: u8 {
        const INSERT = 0x01;
        const UPDATE = 0x02;
        const DELETE = 0x04;
    }
}

impl TriggerEvents {
    #[inline]
    pub fn events(self) -> impl Iterator<Item = TriggerEvent> {
        [
            (TriggerEvents::INSERT, TriggerEvent::Insert),
            (TriggerEvents::UPDATE, TriggerEvent::Update),
            (TriggerEvents::DELETE, TriggerEvent::Delete),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, e)| e)
    }
}

impl From<TriggerEvent> for TriggerEvents {
    #[inline]
    fn from(e: TriggerEvent) -> Self {
        match e {
            TriggerEvent::Insert => TriggerEvents::INSERT,
            TriggerEvent::Update => TriggerEvents::UPDATE,
            TriggerEvent::Delete => TriggerEvents::DELETE,
        }
    }
}

/// Object which caused a table or routine to be added by prelocking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrelockSource {
    Trigger { table: DescId, event: TriggerEvent },
    ForeignKey(DescId),
    Routine(RoutineKey),
    View(DescId),
}

/// What a descriptor is resolved to.
#[derive(Debug, Default)]
pub enum Binding {
    #[default]
    Unbound,
    /// Instance opened by this statement.
    Handle(TableHandle),
    /// Index of the table in the session's locked tables.
    Locked(usize),
    View(ShareRef),
    /// Optional table that does not exist.
    Missing,
}

impl Binding {
    #[inline]
    pub fn is_bound(&self) -> bool {
        !matches!(self, Binding::Unbound)
    }

    #[inline]
    pub fn handle(&self) -> Option<&TableHandle> {
        match self {
            Binding::Handle(h) => Some(h),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct TableDesc {
    pub schema: SmolStr,
    pub name: SmolStr,
    pub alias: SmolStr,
    pub lock: LockType,
    pub mdl_type: MdlType,
    pub trigger_events: TriggerEvents,
    pub embedding: Option<NestId>,
    pub outer_join: bool,
    pub force_index: bool,
    /// Absence of the table is tolerated.
    pub optional: bool,
    pub belong_to_view: Option<DescId>,
    pub prelocking_placeholder: Option<PrelockSource>,
    pub binding: Binding,
    pub ticket: Option<MdlTicket>,
}

impl TableDesc {
    fn new(schema: &str, name: &str, alias: &str, lock: LockType) -> Self {
        TableDesc {
            schema: SmolStr::new(schema),
            name: SmolStr::new(name),
            alias: SmolStr::new(alias),
            lock,
            mdl_type: lock.mdl_type(),
            trigger_events: TriggerEvents::empty(),
            embedding: None,
            outer_join: false,
            force_index: false,
            optional: false,
            belong_to_view: None,
            prelocking_placeholder: None,
            binding: Binding::Unbound,
            ticket: None,
        }
    }

    #[inline]
    pub fn key(&self) -> TableKey {
        TableKey::new(&self.schema, &self.name)
    }

    #[inline]
    pub fn mdl_key(&self) -> MdlKey {
        MdlKey::table(&self.schema, &self.name)
    }

    #[inline]
    pub fn is_same_table(&self, schema: &str, name: &str) -> bool {
        self.schema == schema && self.name == name
    }

    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.prelocking_placeholder.is_some()
    }

    #[inline]
    pub fn handle(&self) -> Option<&TableHandle> {
        self.binding.handle()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JoinNest {
    pub outer_join: bool,
    pub embedding: Option<NestId>,
}

#[derive(Debug)]
pub struct RoutineEntry {
    pub parent: Option<PrelockSource>,
    /// Absence of the routine is tolerated.
    pub optional: bool,
    pub ticket: Option<MdlTicket>,
    pub(crate) processed: bool,
}

/// Tables and routines used by one statement.
///
/// Descriptors live in an arena and are ordered twice: `global` holds
/// every table the statement touches including ones added by prelocking
/// and views, `local` only the tables written in the statement. Local
/// ordering is always a subsequence of global ordering.
#[derive(Debug, Default)]
pub struct TableList {
    descs: Vec<TableDesc>,
    nests: Vec<JoinNest>,
    global: Vec<DescId>,
    local: Vec<DescId>,
    routines: IndexMap<RoutineKey, RoutineEntry>,
    own_descs: usize,
    own_routines: usize,
}

impl TableList {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table written in the statement.
    /// Own tables must be added before the list is opened.
    pub fn add_table(
        &mut self,
        schema: &str,
        name: &str,
        alias: Option<&str>,
        lock: LockType,
    ) -> DescId {
        let id = self.push(TableDesc::new(schema, name, alias.unwrap_or(name), lock));
        self.local.push(id);
        if id.index() == self.own_descs {
            self.own_descs += 1;
        }
        id
    }

    pub fn add_join_nest(&mut self, outer_join: bool, embedding: Option<NestId>) -> NestId {
        let id = NestId(self.nests.len() as u32);
        self.nests.push(JoinNest {
            outer_join,
            embedding,
        });
        id
    }

    #[inline]
    pub fn embed(&mut self, id: DescId, nest: NestId) {
        self.descs[id.index()].embedding = Some(nest);
    }

    /// Add a table required by another object of the statement.
    /// Returns None if the table is already in the list with the
    /// same or stronger lock and events.
    pub fn add_prelocked_table(
        &mut self,
        schema: &str,
        name: &str,
        lock: LockType,
        events: TriggerEvents,
        source: PrelockSource,
    ) -> Option<DescId> {
        let covered = self.global.iter().any(|id| {
            let d = &self.descs[id.index()];
            d.is_same_table(schema, name)
                && (d.lock.is_write() || !lock.is_write())
                && d.trigger_events.contains(events)
        });
        if covered {
            return None;
        }
        let mut desc = TableDesc::new(schema, name, name, lock);
        desc.trigger_events = events;
        desc.prelocking_placeholder = Some(source);
        Some(self.push(desc))
    }

    /// Add a base table of a view.
    pub fn add_view_table(&mut self, view: DescId, schema: &str, name: &str, lock: LockType) -> DescId {
        let parent = &self.descs[view.index()];
        let mut desc = TableDesc::new(schema, name, name, lock);
        desc.belong_to_view = Some(view);
        desc.optional = parent.optional;
        desc.embedding = parent.embedding;
        desc.outer_join = parent.outer_join;
        self.push(desc)
    }

    /// Add a routine to the statement, returns false if it's already there.
    pub fn add_routine(&mut self, key: RoutineKey, parent: Option<PrelockSource>, optional: bool) -> bool {
        if self.routines.contains_key(&key) {
            return false;
        }
        let own = parent.is_none() && self.routines.len() == self.own_routines;
        self.routines.insert(
            key,
            RoutineEntry {
                parent,
                optional,
                ticket: None,
                processed: false,
            },
        );
        if own {
            self.own_routines += 1;
        }
        true
    }

    #[inline]
    fn push(&mut self, desc: TableDesc) -> DescId {
        let id = DescId(self.descs.len() as u32);
        self.descs.push(desc);
        self.global.push(id);
        id
    }

    #[inline]
    pub fn desc(&self, id: DescId) -> &TableDesc {
        &self.descs[id.index()]
    }

    #[inline]
    pub fn desc_mut(&mut self, id: DescId) -> &mut TableDesc {
        &mut self.descs[id.index()]
    }

    #[inline]
    pub fn nest(&self, id: NestId) -> &JoinNest {
        &self.nests[id.0 as usize]
    }

    #[inline]
    pub fn global(&self) -> &[DescId] {
        &self.global
    }

    #[inline]
    pub fn local(&self) -> &[DescId] {
        &self.local
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.global.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    #[inline]
    pub fn routines(&self) -> &IndexMap<RoutineKey, RoutineEntry> {
        &self.routines
    }

    #[inline]
    pub(crate) fn routine_at_mut(&mut self, idx: usize) -> Option<(&RoutineKey, &mut RoutineEntry)> {
        self.routines.get_index_mut(idx).map(|(k, v)| (&*k, v))
    }

    /// Names of global tables in list order, for diagnostics and tests.
    pub fn global_names(&self) -> Vec<SmolStr> {
        self.global
            .iter()
            .map(|id| self.descs[id.index()].name.clone())
            .collect()
    }

    pub fn find_table_in_global_list(&self, schema: &str, name: &str) -> Option<DescId> {
        self.global
            .iter()
            .copied()
            .find(|id| self.descs[id.index()].is_same_table(schema, name))
    }

    pub fn find_table_in_local_list(&self, schema: &str, name: &str) -> Option<DescId> {
        self.local
            .iter()
            .copied()
            .find(|id| self.descs[id.index()].is_same_table(schema, name))
    }

    /// Find another occurrence of the same table, e.g. the source of
    /// INSERT ... SELECT reading its own target. Placeholders are not
    /// considered.
    pub fn unique_table(&self, id: DescId, check_alias: bool) -> Option<DescId> {
        let target = &self.descs[id.index()];
        self.global.iter().copied().find(|other| {
            let d = &self.descs[other.index()];
            *other != id
                && !d.is_placeholder()
                && d.is_same_table(&target.schema, &target.name)
                && (!check_alias || d.alias == target.alias)
        })
    }

    /// Check statement tables have unique aliases. The first duplicate
    /// in statement order is reported.
    pub fn check_dup(&self) -> Result<()> {
        let mut seen: FnvHashSet<&str> = FnvHashSet::default();
        for id in &self.local {
            let alias = &self.descs[id.index()].alias;
            if !seen.insert(alias.as_str()) {
                return Err(Error::NonUniqueTable(alias.clone()));
            }
        }
        Ok(())
    }

    /// Returns whether rows of the table may be null-extended by an
    /// outer join on it or on any nest it is embedded in.
    pub fn is_outer_joined(&self, id: DescId) -> bool {
        let desc = &self.descs[id.index()];
        if desc.outer_join {
            return true;
        }
        let mut nest = desc.embedding;
        while let Some(n) = nest {
            let jn = &self.nests[n.0 as usize];
            if jn.outer_join {
                return true;
            }
            nest = jn.embedding;
        }
        false
    }

    /// Assign table numbers to opened statement tables in order.
    /// Returns number of tables set up.
    pub fn setup_tables(&mut self) -> u32 {
        let local = self.local.clone();
        let mut tablenr = 0;
        for id in local {
            let mut binding = mem::take(&mut self.descs[id.index()].binding);
            if let Binding::Handle(h) = &mut binding {
                h.setup_table_map(self, id, tablenr);
                tablenr += 1;
            }
            self.descs[id.index()].binding = binding;
        }
        tablenr
    }

    /// Unbind all descriptors and forget their tickets.
    /// Returns bindings so caller can release them.
    pub(crate) fn unbind_all(&mut self) -> Vec<Binding> {
        self.descs
            .iter_mut()
            .map(|d| {
                d.ticket = None;
                mem::take(&mut d.binding)
            })
            .filter(|b| b.is_bound())
            .collect()
    }

    /// Remove everything added while opening the list: prelocked
    /// tables, view tables and routines.
    pub fn chop_off_not_own(&mut self) {
        let own = self.own_descs;
        self.descs.truncate(own);
        self.global.retain(|id| id.index() < own);
        self.local.retain(|id| id.index() < own);
        while self.routines.len() > self.own_routines {
            self.routines.pop();
        }
        for entry in self.routines.values_mut() {
            entry.processed = false;
            entry.ticket = None;
        }
    }

    /// Check local ordering is a subsequence of global ordering.
    pub fn is_consistent(&self) -> bool {
        let mut it = self.global.iter();
        self.local.iter().all(|l| it.any(|g| g == l))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_local_ordering() {
        let mut list = TableList::new();
        let t1 = list.add_table("db", "t1", None, LockType::Write);
        let p = list
            .add_prelocked_table(
                "db",
                "log",
                LockType::Write,
                TriggerEvents::INSERT,
                PrelockSource::Trigger {
                    table: t1,
                    event: TriggerEvent::Insert,
                },
            )
            .unwrap();
        assert_eq!(list.global(), &[t1, p]);
        assert_eq!(list.local(), &[t1]);
        assert!(list.is_consistent());
        // covered by existing descriptor
        assert!(list
            .add_prelocked_table(
                "db",
                "log",
                LockType::Read,
                TriggerEvents::empty(),
                PrelockSource::ForeignKey(t1),
            )
            .is_none());
        assert_eq!(list.find_table_in_global_list("db", "log"), Some(p));
        assert_eq!(list.find_table_in_local_list("db", "log"), None);
        list.chop_off_not_own();
        assert_eq!(list.global(), &[t1]);
        assert!(list.is_consistent());
    }

    #[test]
    fn test_check_dup_reports_first() {
        let mut list = TableList::new();
        list.add_table("db", "t1", None, LockType::Read);
        list.add_table("db", "t2", Some("a"), LockType::Read);
        list.add_table("db", "t3", Some("a"), LockType::Read);
        list.add_table("db", "t1", None, LockType::Read);
        assert_eq!(list.check_dup(), Err(Error::NonUniqueTable("a".into())));
    }

    #[test]
    fn test_unique_table() {
        let mut list = TableList::new();
        let t1 = list.add_table("db", "t1", None, LockType::Write);
        let t2 = list.add_table("db", "t2", None, LockType::Read);
        assert_eq!(list.unique_table(t1, false), None);
        let t1b = list.add_table("db", "t1", Some("x"), LockType::Read);
        assert_eq!(list.unique_table(t1, false), Some(t1b));
        assert_eq!(list.unique_table(t1, true), None);
        assert_eq!(list.unique_table(t2, false), None);
        assert!(list.check_dup().is_ok());
    }

    #[test]
    fn test_outer_join_propagation() {
        let mut list = TableList::new();
        let t1 = list.add_table("db", "t1", None, LockType::Read);
        let t2 = list.add_table("db", "t2", None, LockType::Read);
        let t3 = list.add_table("db", "t3", None, LockType::Read);
        let outer = list.add_join_nest(true, None);
        let inner = list.add_join_nest(false, Some(outer));
        list.embed(t2, inner);
        list.desc_mut(t3).outer_join = true;
        assert!(!list.is_outer_joined(t1));
        assert!(list.is_outer_joined(t2));
        assert!(list.is_outer_joined(t3));
        assert!(list.nest(outer).outer_join);
    }

    #[test]
    fn test_routine_set() {
        let mut list = TableList::new();
        let p1 = RoutineKey::procedure("db", "p1");
        assert!(list.add_routine(p1.clone(), None, false));
        assert!(!list.add_routine(p1.clone(), None, false));
        assert!(list.add_routine(
            RoutineKey::function("db", "f1"),
            Some(PrelockSource::Routine(p1)),
            false
        ));
        assert_eq!(list.routines().len(), 2);
        list.chop_off_not_own();
        assert_eq!(list.routines().len(), 1);
    }

    #[test]
    fn test_trigger_events() {
        let events = TriggerEvents::INSERT | TriggerEvents::DELETE;
        let v: Vec<_> = events.events().collect();
        assert_eq!(v, vec![TriggerEvent::Insert, TriggerEvent::Delete]);
        assert_eq!(TriggerEvents::from(TriggerEvent::Update), TriggerEvents::UPDATE);
    }
}
