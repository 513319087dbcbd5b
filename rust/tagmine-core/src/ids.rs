//! Typed identifiers
//!
//! Every long-lived entity gets its own UUID newtype so that a cluster id
//! can never be passed where a point id is expected. Ids serialize as plain
//! UUID strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The 16-byte canonical form, used for store keys and ordering
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

entity_id!(
    /// Identifier of an addressable measurement point
    PointId
);
entity_id!(
    /// Identifier of a logical source-system connection
    DataSourceId
);
entity_id!(
    /// Identifier of a pattern archetype
    PatternId
);
entity_id!(
    /// Identifier of a detected behavioral cluster
    ClusterId
);
entity_id!(
    /// Identifier of a cluster-to-pattern suggestion
    SuggestionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip_as_string() {
        let id = PointId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: PointId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        // Transparent serde: the JSON is a bare UUID string
        assert!(json.starts_with('"'));
    }

    #[test]
    fn test_ids_are_distinct_types() {
        // Compile-time property; here we only check distinct values
        let a = PointId::new();
        let b = PointId::new();
        assert_ne!(a, b);
    }
}
