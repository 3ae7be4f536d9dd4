//! Metadata locks.
//!
//! Metadata locks protect schema objects(tables, routines, schemas) against
//! concurrent DDL. They are independent of row locks and are held for the
//! whole statement or transaction which uses the object.
//!
//! Locks form a hierarchy of three levels. Global and schema level are
//! scoped locks, which only support intention exclusive, shared and
//! exclusive modes. Object level supports the full set of modes below.
pub mod cancel;
pub mod context;
pub mod error;
pub mod manager;
pub mod wait;

pub use cancel::KillSignal;
pub use context::{MdlContext, MdlSavepoint, WaitOptions, LONG_TIMEOUT};
pub use manager::{MdlConfig, MdlManager};

use smol_str::SmolStr;
use std::fmt;

pub type OwnerID = u64;
pub type TicketID = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MdlNamespace {
    Global,
    Schema,
    Table,
    Function,
    Procedure,
    Trigger,
}

impl MdlNamespace {
    /// Returns whether locks in this namespace are scoped locks.
    #[inline]
    pub const fn is_scoped(self) -> bool {
        matches!(self, MdlNamespace::Global | MdlNamespace::Schema)
    }
}

/// Identity of a lockable object.
/// Ordering of keys is the canonical order of acquiring
/// multiple locks at once.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MdlKey {
    pub namespace: MdlNamespace,
    pub schema: SmolStr,
    pub name: SmolStr,
}

impl MdlKey {
    #[inline]
    pub fn new(namespace: MdlNamespace, schema: &str, name: &str) -> Self {
        MdlKey {
            namespace,
            schema: SmolStr::new(schema),
            name: SmolStr::new(name),
        }
    }

    #[inline]
    pub fn global() -> Self {
        Self::new(MdlNamespace::Global, "", "")
    }

    #[inline]
    pub fn schema(schema: &str) -> Self {
        Self::new(MdlNamespace::Schema, schema, "")
    }

    #[inline]
    pub fn table(schema: &str, name: &str) -> Self {
        Self::new(MdlNamespace::Table, schema, name)
    }

    #[inline]
    pub fn function(schema: &str, name: &str) -> Self {
        Self::new(MdlNamespace::Function, schema, name)
    }

    #[inline]
    pub fn procedure(schema: &str, name: &str) -> Self {
        Self::new(MdlNamespace::Procedure, schema, name)
    }
}

impl fmt::Debug for MdlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({}.{})", self.namespace, self.schema, self.name)
    }
}

impl fmt::Display for MdlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace {
            MdlNamespace::Global => f.write_str("GLOBAL"),
            MdlNamespace::Schema => write!(f, "SCHEMA `{}`", self.schema),
            ns => write!(f, "{:?} `{}`.`{}`", ns, self.schema, self.name),
        }
    }
}

/// Lock modes.
///
/// Scoped locks only use `IntentionExclusive`, `Shared` and `Exclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MdlType {
    /// Intention exclusive, scoped locks only.
    IntentionExclusive = 0,
    /// Access metadata only.
    Shared = 1,
    /// Access metadata only, with priority over pending exclusive requests.
    SharedHighPrio = 2,
    /// Read data.
    SharedRead = 3,
    /// Read and write data.
    SharedWrite = 4,
    /// Read data, upgradable to exclusive.
    SharedUpgradable = 5,
    /// Read data, block writers, upgradable to exclusive.
    SharedNoWrite = 6,
    /// Read and write data, block other readers and writers.
    SharedNoReadWrite = 7,
    /// Change metadata.
    Exclusive = 8,
}

const fn bit(ty: MdlType) -> u16 {
    1 << (ty as u8)
}

const IX: u16 = bit(MdlType::IntentionExclusive);
const S: u16 = bit(MdlType::Shared);
const SH: u16 = bit(MdlType::SharedHighPrio);
const SR: u16 = bit(MdlType::SharedRead);
const SW: u16 = bit(MdlType::SharedWrite);
const SU: u16 = bit(MdlType::SharedUpgradable);
const SNW: u16 = bit(MdlType::SharedNoWrite);
const SNRW: u16 = bit(MdlType::SharedNoReadWrite);
const X: u16 = bit(MdlType::Exclusive);

// Bits of granted modes each mode is incompatible with, indexed by mode.
const OBJECT_GRANTED_INCOMPATIBLE: [u16; 9] = [
    X,
    X,
    X,
    SNRW | X,
    SNW | SNRW | X,
    SU | SNW | SNRW | X,
    SW | SU | SNW | SNRW | X,
    SR | SW | SU | SNW | SNRW | X,
    S | SH | SR | SW | SU | SNW | SNRW | X,
];

// Bits of pending modes each mode must queue behind, indexed by mode.
// High priority shared ignores all pending requests.
const OBJECT_WAITING_INCOMPATIBLE: [u16; 9] = [
    X,
    X,
    0,
    SNRW | X,
    SNW | SNRW | X,
    X,
    X,
    X,
    0,
];

const SCOPED_GRANTED_INCOMPATIBLE: [u16; 9] = [
    S | X,
    IX | X,
    IX | X,
    IX | X,
    IX | X,
    IX | X,
    IX | X,
    IX | X,
    IX | S | X,
];

// Pending global read lock has priority over new intention
// exclusive requests.
const SCOPED_WAITING_INCOMPATIBLE: [u16; 9] = [S | X, X, X, X, X, X, X, X, 0];

impl MdlType {
    #[inline]
    pub const fn bit(self) -> u16 {
        bit(self)
    }

    /// Returns granted modes incompatible with this mode.
    #[inline]
    pub const fn granted_incompatible(self, namespace: MdlNamespace) -> u16 {
        if namespace.is_scoped() {
            SCOPED_GRANTED_INCOMPATIBLE[self as usize]
        } else {
            OBJECT_GRANTED_INCOMPATIBLE[self as usize]
        }
    }

    /// Returns pending modes this mode cannot overtake.
    #[inline]
    pub const fn waiting_incompatible(self, namespace: MdlNamespace) -> u16 {
        if namespace.is_scoped() {
            SCOPED_WAITING_INCOMPATIBLE[self as usize]
        } else {
            OBJECT_WAITING_INCOMPATIBLE[self as usize]
        }
    }

    /// Returns whether a lock of this mode grants everything
    /// a lock of other mode grants.
    #[inline]
    pub const fn covers(self, other: MdlType, namespace: MdlNamespace) -> bool {
        let mine = self.granted_incompatible(namespace);
        let theirs = other.granted_incompatible(namespace);
        mine & theirs == theirs
    }

    /// Returns whether this mode allows writing table data.
    #[inline]
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            MdlType::SharedWrite | MdlType::SharedNoReadWrite | MdlType::Exclusive
        )
    }

    /// Returns whether this mode is acquired up front by DDL,
    /// in canonical order and with scoped locks.
    #[inline]
    pub const fn is_strong(self) -> bool {
        (self as u8) >= (MdlType::SharedUpgradable as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MdlDuration {
    /// Released at end of statement.
    Statement,
    /// Released at end of transaction.
    Transaction,
    /// Released explicitly, e.g. by UNLOCK TABLES.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdlRequest {
    pub key: MdlKey,
    pub ty: MdlType,
    pub duration: MdlDuration,
}

impl MdlRequest {
    #[inline]
    pub fn new(key: MdlKey, ty: MdlType, duration: MdlDuration) -> Self {
        MdlRequest { key, ty, duration }
    }
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdlTicket {
    pub(crate) id: TicketID,
    pub(crate) key: MdlKey,
    pub(crate) ty: MdlType,
    pub(crate) duration: MdlDuration,
}

impl MdlTicket {
    #[inline]
    pub fn id(&self) -> TicketID {
        self.id
    }

    #[inline]
    pub fn key(&self) -> &MdlKey {
        &self.key
    }

    #[inline]
    pub fn ty(&self) -> MdlType {
        self.ty
    }

    #[inline]
    pub fn duration(&self) -> MdlDuration {
        self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MdlType::*;

    const ALL: [MdlType; 8] = [
        Shared,
        SharedHighPrio,
        SharedRead,
        SharedWrite,
        SharedUpgradable,
        SharedNoWrite,
        SharedNoReadWrite,
        Exclusive,
    ];

    fn compatible(req: MdlType, granted: MdlType) -> bool {
        req.granted_incompatible(MdlNamespace::Table) & granted.bit() == 0
    }

    #[test]
    fn test_object_matrix_symmetric() {
        for a in ALL {
            for b in ALL {
                assert_eq!(compatible(a, b), compatible(b, a), "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_object_matrix_entries() {
        assert!(compatible(SharedRead, SharedWrite));
        assert!(compatible(SharedWrite, SharedWrite));
        assert!(!compatible(SharedWrite, SharedNoWrite));
        assert!(!compatible(SharedUpgradable, SharedUpgradable));
        assert!(compatible(SharedUpgradable, SharedWrite));
        assert!(!compatible(SharedRead, SharedNoReadWrite));
        assert!(compatible(Shared, SharedNoReadWrite));
        for t in ALL {
            assert!(!compatible(Exclusive, t));
        }
    }

    #[test]
    fn test_waiting_priority() {
        let ns = MdlNamespace::Table;
        // pending exclusive blocks new readers
        assert!(SharedRead.waiting_incompatible(ns) & Exclusive.bit() != 0);
        // but not high priority shared
        assert_eq!(SharedHighPrio.waiting_incompatible(ns), 0);
        // pending global read lock blocks new intention exclusive
        assert!(IntentionExclusive.waiting_incompatible(MdlNamespace::Global) & Shared.bit() != 0);
    }

    #[test]
    fn test_covers() {
        let ns = MdlNamespace::Table;
        assert!(Exclusive.covers(SharedRead, ns));
        assert!(SharedUpgradable.covers(SharedRead, ns));
        assert!(SharedNoReadWrite.covers(SharedWrite, ns));
        assert!(!SharedRead.covers(SharedWrite, ns));
        assert!(SharedRead.covers(SharedRead, ns));
        assert!(!Shared.covers(IntentionExclusive, MdlNamespace::Global));
    }

    #[test]
    fn test_key_order() {
        let mut keys = vec![
            MdlKey::table("db", "b"),
            MdlKey::global(),
            MdlKey::table("db", "a"),
            MdlKey::schema("db"),
        ];
        keys.sort();
        assert_eq!(keys[0], MdlKey::global());
        assert_eq!(keys[1], MdlKey::schema("db"));
        assert_eq!(keys[2], MdlKey::table("db", "a"));
    }
}
