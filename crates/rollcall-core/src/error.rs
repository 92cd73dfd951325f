use crate::codec::CodecError;
use crate::provider::ProviderError;
use std::fmt;
use thiserror::Error;

/// Two vectors that should share the model dimension do not.
///
/// Always a data-integrity bug, never a user mistake.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionError {
    pub expected: usize,
    pub actual: usize,
}

/// Kinds of stored records that lookups can miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Group,
    Identity,
    RosterMember,
    Capture,
    PresenceRecord,
    ErrorLedger,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Group => "group",
            Self::Identity => "identity",
            Self::RosterMember => "roster member",
            Self::Capture => "capture",
            Self::PresenceRecord => "presence record",
            Self::ErrorLedger => "error ledger",
        })
    }
}

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: Entity, key: String },
    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: Entity, key: String },
    #[error("identity {identity} is already on the roster of group {group}")]
    DuplicateMembership { group: String, identity: String },
    #[error("enrollment photo must contain exactly one face, found {faces}")]
    AmbiguousFace { faces: usize },
    #[error("no faces detected in the submitted photo")]
    NoFacesDetected,
    #[error(transparent)]
    Dimension(#[from] DimensionError),
    #[error("embedding provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("stored vector: {0}")]
    Codec(#[from] CodecError),
    #[error("sqlite: {0}")]
    Store(#[from] rusqlite::Error),
}

impl AttendanceError {
    pub(crate) fn not_found(entity: Entity, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn already_exists(entity: Entity, key: impl ToString) -> Self {
        Self::AlreadyExists {
            entity,
            key: key.to_string(),
        }
    }

    /// Whether the error describes a caller mistake (bad id, bad photo) as
    /// opposed to an integrity or infrastructure failure.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::AlreadyExists { .. }
                | Self::DuplicateMembership { .. }
                | Self::AmbiguousFace { .. }
                | Self::NoFacesDetected
        )
    }
}

pub type Result<T, E = AttendanceError> = std::result::Result<T, E>;
