//! rollcall-core — Classroom attendance from one photo.
//!
//! Matches face embeddings detected in a class photo against the enrolled
//! roster, persists the presence set per capture, and keeps a ledger of the
//! corrections teachers make afterwards.

pub mod calibrate;
pub mod codec;
pub mod error;
pub mod ledger;
pub mod matcher;
pub mod provider;
pub mod roster;
pub mod session;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use calibrate::calibrate_threshold;
pub use error::{AttendanceError, DimensionError, Entity};
pub use ledger::{correct, error_ledger, Correction};
pub use matcher::{GreedyMatcher, Matcher, PresenceMap};
pub use provider::{CommandProvider, EmbeddingProvider, ProviderError};
pub use session::SessionManager;
pub use store::{open_db, open_db_in_memory, StoreError};
pub use types::{
    Capture, CaptureId, CaptureOptions, Embedding, ErrorLedger, Group, Identity, IdentityUpdate,
    MemberId, PresenceFilter, PresenceRecord, RosterEntry, DEFAULT_THRESHOLD,
};
