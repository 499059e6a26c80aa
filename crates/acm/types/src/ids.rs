//! Strongly-typed identifiers for ACM entities
//!
//! Runtime-generated IDs are UUID-based newtypes. Definition-scoped names
//! (node templates, element types) use [`ConceptId`], a name/version pair.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a composition definition
    CompositionId,
    "composition"
);
uuid_id!(
    /// Unique identifier for an automation composition instance
    InstanceId,
    "instance"
);
uuid_id!(
    /// Unique identifier for an element within an instance
    ElementId,
    "element"
);
uuid_id!(
    /// Unique identifier for a participant (a logical agent)
    ParticipantId,
    "participant"
);
uuid_id!(
    /// Unique identifier for one replica of a participant
    ReplicaId,
    "replica"
);
uuid_id!(
    /// Unique identifier for a single message send
    MessageId,
    "msg"
);

/// Name/version pair identifying a node template or an element type.
///
/// Serialized as `name:version` so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConceptId {
    pub name: String,
    pub version: String,
}

impl ConceptId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ConceptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl From<ConceptId> for String {
    fn from(id: ConceptId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ConceptId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.rsplit_once(':') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(Self::new(name, version))
            }
            _ => Err(format!("invalid concept id '{value}', expected name:version")),
        }
    }
}

/// Operation token carried on every dispatch and echoed by acks.
///
/// Bumped whenever the runtime issues a new command for an entity, which
/// turns every ack of an earlier command into a stale no-op.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rev:{}", self.0)
    }
}
