//! Three-way lookup outcome
//!
//! Reads against the infrastructure cluster have two distinct "unsuccessful"
//! outcomes: the object is absent, or the read itself failed. Some callers
//! treat absence as a valid answer (existence checks, idempotent deletes),
//! others treat it as an error. `Lookup` keeps the distinction explicit at
//! every call site instead of overloading `Option`/`bool`.

use crate::Error;

/// Result of looking up a single object by key
#[derive(Debug)]
pub enum Lookup<T> {
    /// The object exists
    Found(T),
    /// The store reported that no such object exists
    Absent,
    /// The lookup could not be completed
    Failed(Error),
}

impl<T> Lookup<T> {
    /// Collapse into an existence flag; only `Failed` is an error
    pub fn exists(self) -> Result<bool, Error> {
        match self {
            Lookup::Found(_) => Ok(true),
            Lookup::Absent => Ok(false),
            Lookup::Failed(e) => Err(e),
        }
    }

    /// Collapse into `Option`, treating absence as a valid answer
    pub fn into_option(self) -> Result<Option<T>, Error> {
        match self {
            Lookup::Found(v) => Ok(Some(v)),
            Lookup::Absent => Ok(None),
            Lookup::Failed(e) => Err(e),
        }
    }

    /// Require the object to exist, building the error for the absent case
    pub fn found_or_else(self, absent: impl FnOnce() -> Error) -> Result<T, Error> {
        match self {
            Lookup::Found(v) => Ok(v),
            Lookup::Absent => Err(absent()),
            Lookup::Failed(e) => Err(e),
        }
    }

    /// True for `Absent`
    pub fn is_absent(&self) -> bool {
        matches!(self, Lookup::Absent)
    }
}

impl<T> From<Result<Option<T>, Error>> for Lookup<T> {
    fn from(result: Result<Option<T>, Error>) -> Self {
        match result {
            Ok(Some(v)) => Lookup::Found(v),
            Ok(None) => Lookup::Absent,
            Err(e) if e.is_not_found() => Lookup::Absent,
            Err(e) => Lookup::Failed(e),
        }
    }
}
