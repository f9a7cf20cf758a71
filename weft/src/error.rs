// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! Weft error types

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::result;

/// Result type for operations that could result in a [WeftError]
pub type Result<T> = result::Result<T, WeftError>;

/// Weft error
#[derive(Debug)]
pub enum WeftError {
    /// Error returned when a query omits an option that has no default value.
    /// Raised during option initialization, before anything is scheduled.
    MissingRequiredOption(String),
    /// Error returned when the shape of a resolver's return value violates
    /// the storage contract. Carries a description of the expected and the
    /// observed shape, and optionally a hint on how to fix the resolver.
    ResolverShape {
        /// Description of the shape the engine expected.
        expected: String,
        /// Description of the value the resolver actually returned.
        returned: String,
        /// Optional advice for the resolver author.
        hint: Option<String>,
    },
    /// Error returned when a link with `One` cardinality resolved to Nothing.
    NullNonOptional(String),
    /// Error returned when a link resolver produced an ident that cannot be
    /// used as an index key.
    UnhashableIdent(String),
    /// Error returned when a resolver reads a key that was not provided in
    /// the query context.
    MissingContextKey(String),
    /// Error returned on a branch that is possible but to which we still
    /// have no implementation for, e.g. caching a root-level link.
    Unsupported(String),
    /// Error returned when a graph definition is not valid.
    /// Examples include a missing root node and members resolved by name
    /// that do not exist on the target node.
    Schema(String),
    /// Error raised by a resolver or an executor during execution.
    Execution(String),
    /// Error returned as a consequence of a bug in weft.
    /// Weft has internal invariants that we are unable to ask the compiler
    /// to check for us. This error is raised when one of those invariants is
    /// not verified during execution.
    Internal(String),
    /// Error associated to I/O operations performed by cache adapters.
    IoError(io::Error),
    /// Error returned when serde_json failed to serialize or deserialize
    /// a cached payload.
    SerdeJson(serde_json::Error),
}

impl From<io::Error> for WeftError {
    fn from(e: io::Error) -> Self {
        WeftError::IoError(e)
    }
}

impl From<serde_json::Error> for WeftError {
    fn from(e: serde_json::Error) -> Self {
        WeftError::SerdeJson(e)
    }
}

impl Display for WeftError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            WeftError::MissingRequiredOption(ref desc) => {
                write!(f, "Missing required option: {}", desc)
            }
            WeftError::ResolverShape {
                ref expected,
                ref returned,
                ref hint,
            } => {
                write!(
                    f,
                    "Invalid resolver result shape, expected: {}, returned: {}",
                    expected, returned
                )?;
                if let Some(hint) = hint {
                    write!(f, "\nHint: {}", hint)?;
                }
                Ok(())
            }
            WeftError::NullNonOptional(ref desc) => {
                write!(f, "Non-optional link resolved to Nothing: {}", desc)
            }
            WeftError::UnhashableIdent(ref desc) => {
                write!(f, "Unhashable ident: {}", desc)
            }
            WeftError::MissingContextKey(ref desc) => {
                write!(f, "Missing context key: {}", desc)
            }
            WeftError::Unsupported(ref desc) => {
                write!(f, "This feature is not supported: {}", desc)
            }
            WeftError::Schema(ref desc) => write!(f, "Invalid graph: {}", desc),
            WeftError::Execution(ref desc) => write!(f, "Execution error: {}", desc),
            WeftError::Internal(ref desc) => write!(
                f,
                "Internal error: {}. This was likely caused by a bug in weft's \
                    code and we would welcome that you file an bug report in our issue tracker",
                desc
            ),
            WeftError::IoError(ref desc) => write!(f, "IO error: {}", desc),
            WeftError::SerdeJson(ref desc) => write!(f, "serde_json error: {:?}", desc),
        }
    }
}

impl error::Error for WeftError {}
