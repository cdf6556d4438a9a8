//! Identifier newtypes.
//!
//! All identifiers are opaque strings on the wire. `TaskId` is the only id
//! ever exposed to progress subscribers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Create from an existing string.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Get the inner string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// External-facing correlation id of a generation job. Unique and immutable.
    TaskId
);
string_id!(
    /// Tenant identifier. Every read and write is scoped by it.
    WorkspaceId
);
string_id!(
    /// Workspace member that triggered the job.
    UserId
);
string_id!(
    /// Video project (parent aggregate) identifier.
    ProjectId
);
string_id!(
    /// Rendered video artifact identifier.
    VideoId
);
string_id!(
    /// Audio track identifier; audio regeneration is idempotent on it.
    AudioTrackId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = WorkspaceId::from("ws_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ws_1\"");
        let back: WorkspaceId = serde_json::from_str("\"ws_1\"").unwrap();
        assert_eq!(back, id);
    }
}
