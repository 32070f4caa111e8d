//! Strongly-typed identifiers for Skalds entities.
//!
//! Skald and task identifiers are opaque strings minted outside the
//! controller: executors choose their own skald ids at startup, and task
//! ids come from the submitter (in edge-YAML deployments a task id equals
//! its YAML key). The newtypes exist so the two can never be mixed up at
//! compile time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident, $resource:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from a non-empty string.
            ///
            /// # Errors
            ///
            /// Returns an error if the string is empty or whitespace-only.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(Error::InvalidInput(format!(
                        concat!($resource, " id cannot be empty (got {:?})"),
                        value
                    )));
                }
                Ok(Self(value))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(
    /// A unique identifier for a skald (executor node) in the fleet.
    SkaldId,
    "skald"
);

opaque_id!(
    /// A unique identifier for a task.
    ///
    /// Globally unique; in edge-YAML deployments it equals the YAML key.
    TaskId,
    "task"
);
