use crate::MdlKey;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("Lock wait timeout exceeded on {0}")]
    LockWaitTimeout(MdlKey),
    #[error("Deadlock found when trying to get lock on {0}")]
    Deadlock(MdlKey),
    #[error("Lock on {0} is held by another context")]
    LockConflict(MdlKey),
    #[error("Lock wait on {0} interrupted")]
    Killed(MdlKey),
    #[error("Lock ticket on {0} not owned by context")]
    TicketNotOwned(MdlKey),
}

impl Error {
    /// Returns key of the lock involved.
    #[inline]
    pub fn key(&self) -> &MdlKey {
        match self {
            Error::LockWaitTimeout(k)
            | Error::Deadlock(k)
            | Error::LockConflict(k)
            | Error::Killed(k)
            | Error::TicketNotOwned(k) => k,
        }
    }
}
