use thiserror::Error;

/// Structural defects `validate` can report.
///
/// Each variant names the invariant that failed; `validate` returns the
/// first violation it encounters while walking the level chains.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("level {level} chain does not terminate at the tail sentinel")]
    BrokenChain { level: usize },

    #[error("cycle detected in level {level} chain")]
    Cycle { level: usize },

    #[error("keys out of order at level {level}")]
    Unsorted { level: usize },

    #[error("node reachable at level {level} but absent one level below")]
    LevelSubset { level: usize },

    #[error("live node count {actual} does not match size counter {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Log and return a validation failure.
pub(crate) fn fail<T>(err: Error) -> Result<T> {
    log::warn!("skip list validation failed: {err}");
    Err(err)
}
