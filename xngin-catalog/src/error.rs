use smol_str::SmolStr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Schema '{0}' already exists")]
    SchemaAlreadyExists(SmolStr),
    #[error("Schema '{0}' not exists")]
    SchemaNotExists(SmolStr),
    #[error("Table '{0}' already exists")]
    TableAlreadyExists(SmolStr),
    #[error("Table '{0}' not exists")]
    TableNotExists(SmolStr),
    #[error("Routine '{0}' not exists")]
    RoutineNotExists(SmolStr),
    #[error("Column name '{0}' is not unique")]
    ColumnNameNotUnique(SmolStr),
    #[error("Table '{0}' is marked as crashed and should be repaired")]
    TableCorrupt(SmolStr),
    #[error("Table '{0}' definition must be discovered from storage engine")]
    NeedsDiscovery(SmolStr),
    #[error("Table '{0}' cannot be discovered")]
    DiscoveryFailed(SmolStr),
    #[error("Table '{0}' cannot be repaired")]
    RepairFailed(SmolStr),
}
