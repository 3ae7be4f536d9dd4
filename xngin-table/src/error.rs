use smol_str::SmolStr;
use std::fmt;
use thiserror::Error;
use xngin_catalog::error::Error as CatalogError;
use xngin_catalog::{RoutineKey, RoutineKind, TableKey};
use xngin_mdl::error::Error as MdlError;
use xngin_mdl::{MdlKey, MdlNamespace};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Global,
    Schema,
    Table,
    Function,
    Procedure,
    Trigger,
}

/// Identity of the object an error is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectName {
    pub kind: ObjectKind,
    pub schema: SmolStr,
    pub name: SmolStr,
}

impl ObjectName {
    #[inline]
    pub fn table(schema: &str, name: &str) -> Self {
        ObjectName {
            kind: ObjectKind::Table,
            schema: SmolStr::new(schema),
            name: SmolStr::new(name),
        }
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ObjectKind::Global => f.write_str("GLOBAL"),
            ObjectKind::Schema => write!(f, "`{}`", self.schema),
            _ => write!(f, "`{}`.`{}`", self.schema, self.name),
        }
    }
}

impl From<&TableKey> for ObjectName {
    #[inline]
    fn from(key: &TableKey) -> Self {
        ObjectName::table(key.schema(), key.name())
    }
}

impl From<&RoutineKey> for ObjectName {
    #[inline]
    fn from(key: &RoutineKey) -> Self {
        let kind = match key.kind {
            RoutineKind::Function => ObjectKind::Function,
            RoutineKind::Procedure => ObjectKind::Procedure,
        };
        ObjectName {
            kind,
            schema: key.schema.clone(),
            name: key.name.clone(),
        }
    }
}

impl From<&MdlKey> for ObjectName {
    #[inline]
    fn from(key: &MdlKey) -> Self {
        let kind = match key.namespace {
            MdlNamespace::Global => ObjectKind::Global,
            MdlNamespace::Schema => ObjectKind::Schema,
            MdlNamespace::Table => ObjectKind::Table,
            MdlNamespace::Function => ObjectKind::Function,
            MdlNamespace::Procedure => ObjectKind::Procedure,
            MdlNamespace::Trigger => ObjectKind::Trigger,
        };
        ObjectName {
            kind,
            schema: key.schema.clone(),
            name: key.name.clone(),
        }
    }
}

/// Error classes callers dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Stale,
    Corrupt,
    ResourceExhausted,
    Killed,
    Usage,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Table {0} doesn't exist")]
    NoSuchTable(ObjectName),
    #[error("Routine {0} does not exist")]
    NoSuchRoutine(ObjectName),
    #[error("Table {0} is marked as crashed and should be repaired")]
    TableCorrupt(ObjectName),
    #[error("Table {0} must be discovered from storage engine")]
    NeedsDiscovery(ObjectName),
    #[error("Failed to discover table {0}")]
    DiscoveryFailed(ObjectName),
    #[error("Failed to repair table {0}")]
    RepairFailed(ObjectName),
    #[error("Lock wait timeout exceeded on {0}")]
    LockWaitTimeout(ObjectName),
    #[error("Deadlock found when trying to get lock on {0}")]
    Deadlock(ObjectName),
    #[error("Lock on {0} is held by another session")]
    LockConflict(ObjectName),
    #[error("Too many restarts when opening {0}")]
    TooManyRetries(ObjectName),
    #[error("Definition of {0} is outdated")]
    StaleShare(ObjectName),
    #[error("Table identifiers exhausted")]
    TableIdExhausted,
    #[error("Query execution was interrupted")]
    Killed,
    #[error("Table {0} was not locked with LOCK TABLES")]
    TableNotLocked(ObjectName),
    #[error("Table {0} was locked with a READ lock and can't be updated")]
    TableNotLockedForWrite(ObjectName),
    #[error("No idle instance of table {0}")]
    NoIdleHandle(ObjectName),
    #[error("Not unique table/alias: '{0}'")]
    NonUniqueTable(SmolStr),
    #[error("The server is running with read-only option")]
    ReadOnly,
    #[error("Can't recover {0} with active locked tables or transaction")]
    RecoveryNotAllowed(ObjectName),
    #[error("Table cache is shutting down")]
    ShuttingDown,
    #[error("Catalog error: {0}")]
    Catalog(CatalogError),
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoSuchTable(_) | Error::NoSuchRoutine(_) => ErrorKind::NotFound,
            Error::TableCorrupt(_)
            | Error::NeedsDiscovery(_)
            | Error::DiscoveryFailed(_)
            | Error::RepairFailed(_) => ErrorKind::Corrupt,
            Error::LockWaitTimeout(_)
            | Error::Deadlock(_)
            | Error::LockConflict(_)
            | Error::TooManyRetries(_) => ErrorKind::Conflict,
            Error::StaleShare(_) => ErrorKind::Stale,
            Error::TableIdExhausted => ErrorKind::ResourceExhausted,
            Error::Killed => ErrorKind::Killed,
            Error::TableNotLocked(_)
            | Error::TableNotLockedForWrite(_)
            | Error::NoIdleHandle(_)
            | Error::NonUniqueTable(_)
            | Error::ReadOnly
            | Error::RecoveryNotAllowed(_)
            | Error::ShuttingDown => ErrorKind::Usage,
            Error::Catalog(e) => match e {
                CatalogError::SchemaNotExists(_)
                | CatalogError::TableNotExists(_)
                | CatalogError::RoutineNotExists(_) => ErrorKind::NotFound,
                CatalogError::TableCorrupt(_)
                | CatalogError::NeedsDiscovery(_)
                | CatalogError::DiscoveryFailed(_)
                | CatalogError::RepairFailed(_) => ErrorKind::Corrupt,
                _ => ErrorKind::Usage,
            },
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns the object the error is about, if any.
    #[inline]
    pub fn object(&self) -> Option<&ObjectName> {
        match self {
            Error::NoSuchTable(o)
            | Error::NoSuchRoutine(o)
            | Error::TableCorrupt(o)
            | Error::NeedsDiscovery(o)
            | Error::DiscoveryFailed(o)
            | Error::RepairFailed(o)
            | Error::LockWaitTimeout(o)
            | Error::Deadlock(o)
            | Error::LockConflict(o)
            | Error::TooManyRetries(o)
            | Error::StaleShare(o)
            | Error::TableNotLocked(o)
            | Error::TableNotLockedForWrite(o)
            | Error::NoIdleHandle(o)
            | Error::RecoveryNotAllowed(o) => Some(o),
            _ => None,
        }
    }

    /// Convert error of loading a table definition.
    #[inline]
    pub(crate) fn from_table_load(err: CatalogError, key: &TableKey) -> Self {
        let obj = ObjectName::from(key);
        match err {
            CatalogError::TableNotExists(_) | CatalogError::SchemaNotExists(_) => {
                Error::NoSuchTable(obj)
            }
            CatalogError::TableCorrupt(_) => Error::TableCorrupt(obj),
            CatalogError::NeedsDiscovery(_) => Error::NeedsDiscovery(obj),
            CatalogError::DiscoveryFailed(_) => Error::DiscoveryFailed(obj),
            CatalogError::RepairFailed(_) => Error::RepairFailed(obj),
            other => Error::Catalog(other),
        }
    }

    /// Convert error of loading a routine definition.
    #[inline]
    pub(crate) fn from_routine_load(err: CatalogError, key: &RoutineKey) -> Self {
        match err {
            CatalogError::RoutineNotExists(_) | CatalogError::SchemaNotExists(_) => {
                Error::NoSuchRoutine(ObjectName::from(key))
            }
            other => Error::Catalog(other),
        }
    }
}

impl From<CatalogError> for Error {
    #[inline]
    fn from(src: CatalogError) -> Self {
        Error::Catalog(src)
    }
}

impl From<MdlError> for Error {
    #[inline]
    fn from(src: MdlError) -> Self {
        match src {
            MdlError::LockWaitTimeout(k) => Error::LockWaitTimeout(ObjectName::from(&k)),
            MdlError::Deadlock(k) => Error::Deadlock(ObjectName::from(&k)),
            MdlError::LockConflict(k) => Error::LockConflict(ObjectName::from(&k)),
            MdlError::Killed(_) => Error::Killed,
            MdlError::TicketNotOwned(_) => Error::Internal("metadata lock ticket not owned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_object() {
        let key = TableKey::new("db", "t1");
        let err = Error::from_table_load(CatalogError::TableNotExists("db.t1".into()), &key);
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.object(), Some(&ObjectName::table("db", "t1")));
        assert_eq!(err.to_string(), "Table `db`.`t1` doesn't exist");

        let err = Error::from(MdlError::Deadlock(MdlKey::table("db", "t1")));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err, Error::Deadlock(ObjectName::table("db", "t1")));

        let err = Error::from(MdlError::Killed(MdlKey::global()));
        assert_eq!(err.kind(), ErrorKind::Killed);
        assert!(err.object().is_none());
        assert_eq!(Error::TableIdExhausted.kind(), ErrorKind::ResourceExhausted);
    }
}
