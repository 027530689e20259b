use std::fmt;

/// Logical failures reported by table operations.
///
/// Transient lock-free contention is retried internally and never reported;
/// API misuse (unbalanced read locks, unregistered threads) panics instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The target node was concurrently removed.
    NotFound,
    /// A size argument was not zero or a power of two.
    InvalidArg,
    /// Destruction was attempted while user nodes remain in the table.
    NonEmpty,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => f.write_str("node was concurrently removed"),
            Error::InvalidArg => f.write_str("size must be zero or a power of two"),
            Error::NonEmpty => f.write_str("table still contains user nodes"),
        }
    }
}

impl std::error::Error for Error {}
