use std::fmt;

/// Errors that can cross the public boundary of a [crate::Cache].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A construction option failed validation. Only returned while building a cache.
    InvalidConfiguration {
        /// Name of the offending option.
        option: &'static str,
        /// What was wrong with the value.
        reason: &'static str,
    },
    /// The value computation for a missing key was cancelled before producing a value.
    /// The cache is left unmodified.
    ComputationAborted,
}

impl Error {
    #[inline]
    pub(crate) fn invalid(option: &'static str, reason: &'static str) -> Self {
        Error::InvalidConfiguration { option, reason }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfiguration { option, reason } => {
                write!(f, "invalid value for option `{}`: {}", option, reason)
            }
            Error::ComputationAborted => f.write_str("value computation was aborted"),
        }
    }
}

impl std::error::Error for Error {}
