use crate::engine::{EngineError, EngineHandle};
use rollcall_core::{IdentityUpdate, PresenceFilter};
use serde::Serialize;
use zbus::{fdo, interface};

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub engine: EngineHandle,
    pub db_path: String,
    pub extractor: String,
}

fn to_fdo(err: EngineError) -> fdo::Error {
    if err.is_user_facing() {
        fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::error!(error = %err, "request failed");
        fdo::Error::Failed(err.to_string())
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    async fn create_group(&self, code: String, name: String) -> fdo::Result<String> {
        tracing::info!(%code, %name, "create_group requested");
        let group = self
            .engine
            .run(move |e| e.create_group(&code, &name))
            .await
            .map_err(to_fdo)?;
        to_json(&group)
    }

    /// Remove a group with its roster and every capture taken for it.
    async fn remove_group(&self, code: String) -> fdo::Result<()> {
        tracing::info!(%code, "remove_group requested");
        self.engine
            .run(move |e| e.remove_group(&code))
            .await
            .map_err(to_fdo)
    }

    /// Enroll an identity from a photo holding exactly one face.
    async fn enroll(&self, key: String, display_name: String, photo: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(%key, %display_name, bytes = photo.len(), "enroll requested");
        let identity = self
            .engine
            .run(move |e| e.enroll(&key, &display_name, &photo))
            .await
            .map_err(to_fdo)?;
        to_json(&serde_json::json!({
            "key": identity.key,
            "display_name": identity.display_name,
            "dimension": identity.embedding.dim(),
            "enrolled_at": identity.enrolled_at,
        }))
    }

    async fn rename_identity(&self, key: String, display_name: String) -> fdo::Result<()> {
        tracing::info!(%key, %display_name, "rename_identity requested");
        let update = IdentityUpdate {
            display_name: Some(display_name),
            photo: None,
        };
        self.engine
            .run(move |e| e.update_identity(&key, update))
            .await
            .map_err(to_fdo)
    }

    /// Replace an identity's reference vector from a new photo.
    async fn reenroll(&self, key: String, photo: Vec<u8>) -> fdo::Result<()> {
        tracing::info!(%key, bytes = photo.len(), "reenroll requested");
        let update = IdentityUpdate {
            display_name: None,
            photo: Some(photo),
        };
        self.engine
            .run(move |e| e.update_identity(&key, update))
            .await
            .map_err(to_fdo)
    }

    async fn remove_identity(&self, key: String) -> fdo::Result<()> {
        tracing::info!(%key, "remove_identity requested");
        self.engine
            .run(move |e| e.remove_identity(&key))
            .await
            .map_err(to_fdo)
    }

    /// Add an enrolled identity to a group's roster. Returns the member id.
    async fn add_member(&self, group: String, identity: String) -> fdo::Result<i64> {
        tracing::info!(%group, %identity, "add_member requested");
        self.engine
            .run(move |e| e.add_member(&group, &identity))
            .await
            .map_err(to_fdo)
    }

    async fn remove_member(&self, group: String, identity: String) -> fdo::Result<()> {
        tracing::info!(%group, %identity, "remove_member requested");
        self.engine
            .run(move |e| e.remove_member(&group, &identity))
            .await
            .map_err(to_fdo)
    }

    /// Take attendance for a group from one photo. Returns the capture as JSON.
    async fn create_capture(&self, group: String, photo: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(%group, bytes = photo.len(), "create_capture requested");
        let capture = self
            .engine
            .run(move |e| e.create_capture(&group, &photo))
            .await
            .map_err(to_fdo)?;
        to_json(&capture)
    }

    /// Recompute a capture from a new photo; resets its error ledger.
    async fn replace_capture(&self, capture_id: i64, photo: Vec<u8>) -> fdo::Result<()> {
        tracing::info!(capture_id, bytes = photo.len(), "replace_capture requested");
        self.engine
            .run(move |e| e.replace_capture(capture_id, &photo))
            .await
            .map_err(to_fdo)
    }

    async fn delete_capture(&self, capture_id: i64) -> fdo::Result<()> {
        tracing::info!(capture_id, "delete_capture requested");
        self.engine
            .run(move |e| e.delete_capture(capture_id))
            .await
            .map_err(to_fdo)
    }

    /// Overwrite one presence status. Returns the updated ledger as JSON.
    async fn correct(&self, capture_id: i64, member_id: i64, present: bool) -> fdo::Result<String> {
        tracing::info!(capture_id, member_id, present, "correct requested");
        let ledger = self
            .engine
            .run(move |e| e.correct(capture_id, member_id, present))
            .await
            .map_err(to_fdo)?;
        to_json(&ledger)
    }

    async fn list_captures(&self, group: String) -> fdo::Result<String> {
        let captures = self
            .engine
            .run(move |e| e.list_captures(&group))
            .await
            .map_err(to_fdo)?;
        to_json(&captures)
    }

    /// Presence records of a capture as JSON.
    ///
    /// An empty `identity` and a `member_id` of 0 mean "no filter".
    async fn presence(&self, capture_id: i64, identity: String, member_id: i64) -> fdo::Result<String> {
        let filter = PresenceFilter {
            identity: (!identity.is_empty()).then_some(identity),
            member_id: (member_id > 0).then_some(member_id),
        };
        let records = self
            .engine
            .run(move |e| e.presence(capture_id, &filter))
            .await
            .map_err(to_fdo)?;
        to_json(&records)
    }

    async fn error_ledger(&self, capture_id: i64) -> fdo::Result<String> {
        let ledger = self
            .engine
            .run(move |e| e.error_ledger(capture_id))
            .await
            .map_err(to_fdo)?;
        to_json(&ledger)
    }

    /// Highest similarity between two distinct roster members of a group.
    async fn calibrate_threshold(&self, group: String) -> fdo::Result<f64> {
        let threshold = self
            .engine
            .run(move |e| e.calibrate(&group))
            .await
            .map_err(to_fdo)?;
        Ok(f64::from(threshold))
    }

    /// JPEG thumbnail of the capture photo; empty when none was stored.
    async fn thumbnail(&self, capture_id: i64) -> fdo::Result<Vec<u8>> {
        let thumbnail = self
            .engine
            .run(move |e| e.thumbnail(capture_id))
            .await
            .map_err(to_fdo)?;
        Ok(thumbnail.unwrap_or_default())
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let (stats, threshold) = self
            .engine
            .run(|e| Ok((e.stats()?, e.default_threshold())))
            .await
            .map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "db_path": self.db_path,
            "extractor": self.extractor,
            "similarity_threshold": threshold,
            "groups": stats.groups,
            "identities": stats.identities,
            "captures": stats.captures,
        })
        .to_string())
    }
}
