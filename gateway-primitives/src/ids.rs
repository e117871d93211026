//! Identifier types shared by every gateway crate.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier, rejecting blank values.
            ///
            /// # Errors
            ///
            /// Returns [`Error::EmptyId`] when the value is empty or whitespace only.
            pub fn new(value: impl Into<String>) -> Result<Self, Error> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(Error::EmptyId { kind: $kind });
                }
                Ok(Self(value))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the owned string.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

string_id!(
    /// Identifier of the tenant that owns policies and issues requests.
    TenantId,
    "tenant"
);

string_id!(
    /// Opaque policy identifier. Generated as a UUID v4 when the caller omits one.
    PolicyId,
    "policy"
);

string_id!(
    /// Correlates a governed request across the pipeline, audit and metrics.
    RequestId,
    "request"
);

string_id!(
    /// Identifier stamped on each audit entry.
    AuditId,
    "audit"
);

impl PolicyId {
    /// Generates a random policy identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl RequestId {
    /// Generates a random request identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl AuditId {
    /// Generates an identifier of the form `audit_<unix-seconds>_<8 hex chars>`.
    #[must_use]
    pub fn generate() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("audit_{secs}_{}", &suffix[..8]))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::random()
    }
}
