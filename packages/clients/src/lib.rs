//! Shared client library for the content store.
//!
//! This library owns the content identity types that cross the wire
//! (hashes, selectors, dedup references), the capability traits a content
//! session exposes, and the decorators layered on top of any backend:
//! bounded retries with per-attempt tracing, and the dedup-aware pin
//! strategy.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! We use `#[non_exhaustive]` on structs and enums to prevent users manually
//! constructing the types while still allowing their fields to be `pub` for
//! reading. The intention here is that users must generally construct the
//! types either by:
//! - Using constructors on the types
//! - Using builder methods
//! - Using deserialization
//!
//! We do this because some types in this module may contain invariants that
//! need to be upheld, and it's easier to ensure that all types follow these
//! guidelines in the module than do it piecemeal.

use std::{fmt, str::FromStr};

use color_eyre::eyre::bail;
use serde::{Deserialize, Serialize};
use tap::Pipe;

pub mod dedup;
pub mod hash;
pub mod retry;
pub mod session;

pub use hash::{ContentHash, HashAlgorithm, Selector};
pub use session::{PinResult, PlaceResult};

/// An authentication token for access to the content store or to a peer.
///
/// This type wraps a token string and ensures it is never accidentally leaked
/// in logs or debug output. To access the actual token value, use the
/// `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl FromStr for Token {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("token cannot be empty");
        }
        String::from(s).pipe(Self).pipe(Ok)
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}
