use crate::error::{ErrorKind, Result};

/// Swallows "not found" errors of speculative opens and counts
/// everything it saw.
#[derive(Debug, Default)]
pub struct NoSuchTableTrap {
    trapped: usize,
    unhandled: usize,
}

impl NoSuchTableTrap {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(None)` for a trapped error, other errors pass through.
    #[inline]
    pub fn handle<T>(&mut self, res: Result<T>) -> Result<Option<T>> {
        match res {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.trapped += 1;
                Ok(None)
            }
            Err(e) => {
                self.unhandled += 1;
                Err(e)
            }
        }
    }

    #[inline]
    pub fn trapped(&self) -> usize {
        self.trapped
    }

    #[inline]
    pub fn unhandled(&self) -> usize {
        self.unhandled
    }

    /// True if errors were seen and all of them were trapped.
    #[inline]
    pub fn safely_trapped_errors(&self) -> bool {
        self.trapped > 0 && self.unhandled == 0
    }
}
