//! Attendance sessions: one photo in, one durable presence set out.
//!
//! A capture is always written whole: its presence records (one per roster
//! member) and a zeroed error ledger are created in the caller's transaction
//! together with the capture row. Re-taking attendance replaces both sets
//! instead of patching them. All preconditions are checked before the first
//! write.

use crate::codec;
use crate::error::{AttendanceError, Entity, Result};
use crate::matcher::{GreedyMatcher, Matcher, PresenceMap};
use crate::provider::EmbeddingProvider;
use crate::roster;
use crate::store::{now_text, parse_timestamp};
use crate::types::{
    Capture, CaptureId, CaptureOptions, Embedding, Identity, IdentityUpdate, MemberId,
    PresenceFilter, PresenceRecord, DEFAULT_THRESHOLD,
};
use image::imageops::FilterType;
use image::ImageFormat;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use sha2::{Digest, Sha256};
use std::io::Cursor;

/// Stored thumbnail size of a capture photo.
pub const THUMBNAIL_WIDTH: u32 = 512;
pub const THUMBNAIL_HEIGHT: u32 = 256;

const CAPTURE_COLUMNS: &str = "id, group_code, taken_at, photo_digest, face_count";

/// Everything derived from one photo before any row is written.
struct Computed {
    presence: PresenceMap<MemberId>,
    detections: Vec<Embedding>,
    digest: String,
    thumbnail: Option<Vec<u8>>,
}

/// Runs attendance captures with an injected embedding provider.
pub struct SessionManager<P, M = GreedyMatcher> {
    provider: P,
    matcher: M,
    default_threshold: f32,
}

impl<P: EmbeddingProvider> SessionManager<P> {
    pub fn new(provider: P) -> Self {
        Self::with_matcher(provider, GreedyMatcher)
    }
}

impl<P: EmbeddingProvider, M: Matcher> SessionManager<P, M> {
    pub fn with_matcher(provider: P, matcher: M) -> Self {
        Self {
            provider,
            matcher,
            default_threshold: DEFAULT_THRESHOLD,
        }
    }

    /// Threshold used when [`CaptureOptions::threshold`] is `None`.
    pub fn with_default_threshold(mut self, threshold: f32) -> Self {
        self.default_threshold = threshold;
        self
    }

    pub fn default_threshold(&self) -> f32 {
        self.default_threshold
    }

    /// Take attendance for `group` from one photo.
    ///
    /// Fails with `NotFound` when the group is unknown or its roster is empty
    /// (checked before the provider runs) and with `NoFacesDetected` when the
    /// provider finds no face.
    pub fn create_capture(
        &mut self,
        tx: &Transaction<'_>,
        group: &str,
        photo: &[u8],
        options: CaptureOptions,
    ) -> Result<Capture> {
        let threshold = options.threshold.unwrap_or(self.default_threshold);
        let computed = self.compute(tx, group, photo, threshold)?;

        tx.execute(
            "INSERT INTO captures (group_code, taken_at, photo_digest, face_count, detections, thumbnail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                group,
                now_text(),
                computed.digest,
                computed.detections.len() as i64,
                codec::encode_set(&computed.detections),
                computed.thumbnail,
            ],
        )?;
        let capture_id = tx.last_insert_rowid();
        write_presence(tx, capture_id, &computed.presence)?;

        tracing::info!(
            group,
            capture_id,
            faces = computed.detections.len(),
            present = computed.presence.present_count(),
            roster = computed.presence.len(),
            threshold,
            "capture created"
        );
        capture(tx, capture_id)
    }

    /// Re-take attendance for an existing capture from a new photo.
    ///
    /// The old presence set and ledger are discarded and rebuilt against the
    /// group's current roster; the ledger restarts at (0, 0).
    pub fn replace_capture(
        &mut self,
        tx: &Transaction<'_>,
        capture_id: CaptureId,
        photo: &[u8],
        options: CaptureOptions,
    ) -> Result<()> {
        let group = capture(tx, capture_id)?.group;
        let threshold = options.threshold.unwrap_or(self.default_threshold);
        let computed = self.compute(tx, &group, photo, threshold)?;

        tx.execute("DELETE FROM presence_records WHERE capture_id = ?1", [capture_id])?;
        tx.execute("DELETE FROM error_ledgers WHERE capture_id = ?1", [capture_id])?;
        tx.execute(
            "UPDATE captures
             SET taken_at = ?2, photo_digest = ?3, face_count = ?4, detections = ?5, thumbnail = ?6
             WHERE id = ?1",
            params![
                capture_id,
                now_text(),
                computed.digest,
                computed.detections.len() as i64,
                codec::encode_set(&computed.detections),
                computed.thumbnail,
            ],
        )?;
        write_presence(tx, capture_id, &computed.presence)?;

        tracing::info!(
            group = %group,
            capture_id,
            faces = computed.detections.len(),
            present = computed.presence.present_count(),
            roster = computed.presence.len(),
            threshold,
            "capture replaced"
        );
        Ok(())
    }

    /// Enroll an identity through this manager's provider.
    pub fn enroll(
        &mut self,
        tx: &Transaction<'_>,
        key: &str,
        display_name: &str,
        photo: &[u8],
    ) -> Result<Identity> {
        roster::enroll(tx, &mut self.provider, key, display_name, photo)
    }

    /// Rename and/or re-enroll an identity through this manager's provider.
    pub fn update_identity(
        &mut self,
        tx: &Transaction<'_>,
        key: &str,
        update: IdentityUpdate,
    ) -> Result<()> {
        roster::update_identity(tx, &mut self.provider, key, update)
    }

    fn compute(
        &mut self,
        conn: &Connection,
        group: &str,
        photo: &[u8],
        threshold: f32,
    ) -> Result<Computed> {
        let roster = roster::roster_vectors(conn, group)?;
        if roster.is_empty() {
            return Err(AttendanceError::not_found(Entity::RosterMember, group));
        }

        let detections = self.provider.extract(photo)?;
        if detections.is_empty() {
            return Err(AttendanceError::NoFacesDetected);
        }

        let candidates: Vec<(MemberId, Embedding)> = roster
            .into_iter()
            .map(|entry| (entry.member_id, entry.embedding))
            .collect();
        let presence = self.matcher.assign(&candidates, &detections, threshold)?;

        Ok(Computed {
            presence,
            detections,
            digest: format!("{:x}", Sha256::digest(photo)),
            thumbnail: thumbnail(photo),
        })
    }
}

/// Delete a capture together with its presence records and ledger.
pub fn delete_capture(tx: &Transaction<'_>, capture_id: CaptureId) -> Result<()> {
    let removed = tx.execute("DELETE FROM captures WHERE id = ?1", [capture_id])?;
    if removed == 0 {
        return Err(AttendanceError::not_found(Entity::Capture, capture_id));
    }
    tracing::info!(capture_id, "capture deleted");
    Ok(())
}

pub fn capture(conn: &Connection, capture_id: CaptureId) -> Result<Capture> {
    conn.query_row(
        &format!("SELECT {CAPTURE_COLUMNS} FROM captures WHERE id = ?1"),
        [capture_id],
        capture_from_row,
    )
    .optional()?
    .ok_or_else(|| AttendanceError::not_found(Entity::Capture, capture_id))
}

/// Captures of a group, oldest first.
pub fn list_captures(conn: &Connection, group: &str) -> Result<Vec<Capture>> {
    if !roster::group_exists(conn, group)? {
        return Err(AttendanceError::not_found(Entity::Group, group));
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT {CAPTURE_COLUMNS} FROM captures WHERE group_code = ?1 ORDER BY id"
    ))?;
    let captures = stmt
        .query_map([group], capture_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(captures)
}

/// Presence records of a capture in roster order, optionally narrowed.
pub fn presence(
    conn: &Connection,
    capture_id: CaptureId,
    filter: &PresenceFilter,
) -> Result<Vec<PresenceRecord>> {
    capture(conn, capture_id)?;

    let mut stmt = conn.prepare(
        "SELECT p.member_id, m.identity_key, p.present
         FROM presence_records p
         JOIN roster_members m ON m.id = p.member_id
         WHERE p.capture_id = ?1
           AND (?2 IS NULL OR m.identity_key = ?2)
           AND (?3 IS NULL OR p.member_id = ?3)
         ORDER BY p.member_id",
    )?;
    let records = stmt
        .query_map(
            params![capture_id, filter.identity, filter.member_id],
            |row| {
                Ok(PresenceRecord {
                    member_id: row.get(0)?,
                    identity: row.get(1)?,
                    present: row.get(2)?,
                })
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Raw vectors the provider returned for the capture's photo, in arrival order.
pub fn capture_detections(conn: &Connection, capture_id: CaptureId) -> Result<Vec<Embedding>> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT detections FROM captures WHERE id = ?1",
            [capture_id],
            |row| row.get(0),
        )
        .optional()?;
    let blob = blob.ok_or_else(|| AttendanceError::not_found(Entity::Capture, capture_id))?;
    Ok(codec::decode_set(&blob)?)
}

/// JPEG thumbnail of the capture photo, if the photo could be decoded.
pub fn capture_thumbnail(conn: &Connection, capture_id: CaptureId) -> Result<Option<Vec<u8>>> {
    conn.query_row(
        "SELECT thumbnail FROM captures WHERE id = ?1",
        [capture_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| AttendanceError::not_found(Entity::Capture, capture_id))
}

fn capture_from_row(row: &Row<'_>) -> rusqlite::Result<Capture> {
    let taken_at: String = row.get(2)?;
    Ok(Capture {
        id: row.get(0)?,
        group: row.get(1)?,
        taken_at: parse_timestamp(2, &taken_at)?,
        photo_digest: row.get(3)?,
        face_count: row.get::<_, i64>(4)? as usize,
    })
}

fn write_presence(
    tx: &Transaction<'_>,
    capture_id: CaptureId,
    presence: &PresenceMap<MemberId>,
) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO presence_records (capture_id, member_id, present) VALUES (?1, ?2, ?3)",
    )?;
    for (member_id, present) in presence.iter() {
        stmt.execute(params![capture_id, member_id, present])?;
    }
    tx.execute(
        "INSERT INTO error_ledgers (capture_id, false_positive_count, false_negative_count)
         VALUES (?1, 0, 0)",
        [capture_id],
    )?;
    Ok(())
}

/// Downscale the photo to a fixed-size JPEG. Failure only costs the
/// thumbnail: photos the extractor understands may still be undecodable here.
fn thumbnail(photo: &[u8]) -> Option<Vec<u8>> {
    let encoded = image::load_from_memory(photo).and_then(|img| {
        let resized = img
            .resize_exact(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT, FilterType::CatmullRom)
            .into_rgb8();
        let mut out = Cursor::new(Vec::new());
        resized.write_to(&mut out, ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    });

    match encoded {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            tracing::warn!(error = %err, photo_bytes = photo.len(), "could not build capture thumbnail");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_db_in_memory;
    use crate::testing::FakeProvider;
    use image::{Rgb, RgbImage};

    /// Group CS101 with Ana (member 1, [3,4]) and Bruno (member 2, [0,1]).
    fn setup(provider: FakeProvider) -> (Connection, SessionManager<FakeProvider>) {
        let provider = provider
            .with(b"enroll-ana", &[&[3.0, 4.0]])
            .with(b"enroll-bruno", &[&[0.0, 1.0]]);
        let mut sessions = SessionManager::new(provider);
        let mut conn = open_db_in_memory().unwrap();

        let tx = conn.transaction().unwrap();
        roster::create_group(&tx, "CS101", "Intro").unwrap();
        sessions.enroll(&tx, "ana", "Ana", b"enroll-ana").unwrap();
        sessions.enroll(&tx, "bruno", "Bruno", b"enroll-bruno").unwrap();
        roster::add_member(&tx, "CS101", "ana").unwrap();
        roster::add_member(&tx, "CS101", "bruno").unwrap();
        tx.commit().unwrap();

        (conn, sessions)
    }

    fn statuses(conn: &Connection, capture_id: CaptureId) -> Vec<(String, bool)> {
        presence(conn, capture_id, &PresenceFilter::default())
            .unwrap()
            .into_iter()
            .map(|r| (r.identity, r.present))
            .collect()
    }

    #[test]
    fn test_create_capture_writes_full_presence_set() {
        // Similarity to Ana is 0.6, to Bruno 0.0.
        let (mut conn, mut sessions) = setup(FakeProvider::default().with(b"class", &[&[1.0, 0.0]]));

        let tx = conn.transaction().unwrap();
        let capture = sessions
            .create_capture(&tx, "CS101", b"class", CaptureOptions::default())
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(capture.group, "CS101");
        assert_eq!(capture.face_count, 1);
        assert_eq!(capture.photo_digest.len(), 64);
        assert_eq!(
            statuses(&conn, capture.id),
            vec![("ana".to_string(), true), ("bruno".to_string(), false)]
        );
        assert_eq!(
            capture_detections(&conn, capture.id).unwrap(),
            vec![Embedding::new(vec![1.0, 0.0])]
        );
    }

    #[test]
    fn test_supplied_threshold_overrides_default() {
        let (mut conn, mut sessions) = setup(FakeProvider::default().with(b"class", &[&[1.0, 0.0]]));

        let tx = conn.transaction().unwrap();
        let options = CaptureOptions { threshold: Some(0.7) };
        let capture = sessions.create_capture(&tx, "CS101", b"class", options).unwrap();

        assert!(presence(&tx, capture.id, &PresenceFilter::default())
            .unwrap()
            .iter()
            .all(|r| !r.present));
    }

    #[test]
    fn test_unknown_group_and_empty_roster_checked_before_provider() {
        let (mut conn, mut sessions) = setup(FakeProvider::default().with(b"class", &[&[1.0, 0.0]]));
        let calls_before = sessions.provider.calls;

        let tx = conn.transaction().unwrap();
        let unknown = sessions
            .create_capture(&tx, "MA999", b"class", CaptureOptions::default())
            .unwrap_err();
        assert!(matches!(unknown, AttendanceError::NotFound { entity: Entity::Group, .. }));

        roster::create_group(&tx, "EMPTY", "Nobody").unwrap();
        let empty = sessions
            .create_capture(&tx, "EMPTY", b"class", CaptureOptions::default())
            .unwrap_err();
        assert!(matches!(empty, AttendanceError::NotFound { entity: Entity::RosterMember, .. }));

        assert_eq!(sessions.provider.calls, calls_before);
    }

    #[test]
    fn test_no_faces_detected_writes_nothing() {
        let (mut conn, mut sessions) = setup(FakeProvider::default());

        let tx = conn.transaction().unwrap();
        let err = sessions
            .create_capture(&tx, "CS101", b"blank-wall", CaptureOptions::default())
            .unwrap_err();
        assert!(matches!(err, AttendanceError::NoFacesDetected));
        assert!(list_captures(&tx, "CS101").unwrap().is_empty());
    }

    #[test]
    fn test_replace_capture_rebuilds_presence() {
        let provider = FakeProvider::default()
            .with(b"monday", &[&[1.0, 0.0]])
            .with(b"monday-retake", &[&[0.0, 2.0], &[0.1, 1.0]]);
        let (mut conn, mut sessions) = setup(provider);

        let tx = conn.transaction().unwrap();
        let capture = sessions
            .create_capture(&tx, "CS101", b"monday", CaptureOptions::default())
            .unwrap();
        sessions
            .replace_capture(&tx, capture.id, b"monday-retake", CaptureOptions::default())
            .unwrap();
        tx.commit().unwrap();

        // [0,2] is exactly Bruno's direction (1.0) and is discarded; [0.1,1]
        // then matches Bruno. Ana is no longer seen.
        assert_eq!(
            statuses(&conn, capture.id),
            vec![("ana".to_string(), false), ("bruno".to_string(), true)]
        );
        let replaced = super::capture(&conn, capture.id).unwrap();
        assert_eq!(replaced.face_count, 2);
        assert_ne!(replaced.photo_digest, capture.photo_digest);
        assert_eq!(list_captures(&conn, "CS101").unwrap().len(), 1);
    }

    #[test]
    fn test_replace_missing_capture() {
        let (mut conn, mut sessions) = setup(FakeProvider::default().with(b"class", &[&[1.0, 0.0]]));
        let tx = conn.transaction().unwrap();
        let err = sessions
            .replace_capture(&tx, 42, b"class", CaptureOptions::default())
            .unwrap_err();
        assert!(matches!(err, AttendanceError::NotFound { entity: Entity::Capture, .. }));
    }

    #[test]
    fn test_failed_replace_keeps_previous_presence() {
        let (mut conn, mut sessions) = setup(FakeProvider::default().with(b"class", &[&[1.0, 0.0]]));

        let tx = conn.transaction().unwrap();
        let capture = sessions
            .create_capture(&tx, "CS101", b"class", CaptureOptions::default())
            .unwrap();
        let err = sessions
            .replace_capture(&tx, capture.id, b"no-faces", CaptureOptions::default())
            .unwrap_err();
        assert!(matches!(err, AttendanceError::NoFacesDetected));
        tx.commit().unwrap();

        assert_eq!(
            statuses(&conn, capture.id),
            vec![("ana".to_string(), true), ("bruno".to_string(), false)]
        );
    }

    #[test]
    fn test_delete_capture_cascades() {
        let (mut conn, mut sessions) = setup(FakeProvider::default().with(b"class", &[&[1.0, 0.0]]));

        let tx = conn.transaction().unwrap();
        let capture = sessions
            .create_capture(&tx, "CS101", b"class", CaptureOptions::default())
            .unwrap();
        delete_capture(&tx, capture.id).unwrap();
        tx.commit().unwrap();

        let orphans: i64 = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM presence_records) + (SELECT COUNT(*) FROM error_ledgers)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);

        let tx = conn.transaction().unwrap();
        assert!(matches!(
            delete_capture(&tx, capture.id),
            Err(AttendanceError::NotFound { entity: Entity::Capture, .. })
        ));
    }

    #[test]
    fn test_presence_filters() {
        let (mut conn, mut sessions) = setup(FakeProvider::default().with(b"class", &[&[1.0, 0.0]]));
        let tx = conn.transaction().unwrap();
        let capture = sessions
            .create_capture(&tx, "CS101", b"class", CaptureOptions::default())
            .unwrap();

        let by_identity = PresenceFilter {
            identity: Some("bruno".into()),
            member_id: None,
        };
        let records = presence(&tx, capture.id, &by_identity).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].present);

        let ana_member = roster::member_id(&tx, "CS101", "ana").unwrap().unwrap();
        let by_member = PresenceFilter {
            identity: None,
            member_id: Some(ana_member),
        };
        let records = presence(&tx, capture.id, &by_member).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].identity, "ana");

        assert!(presence(&tx, 999, &PresenceFilter::default()).is_err());
    }

    #[test]
    fn test_thumbnail_from_decodable_photo() {
        let mut png = Cursor::new(Vec::new());
        RgbImage::from_pixel(8, 4, Rgb([200, 10, 10]))
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        let photo = png.into_inner();

        let (mut conn, mut sessions) = setup(FakeProvider::default().with(&photo, &[&[1.0, 0.0]]));
        let tx = conn.transaction().unwrap();
        let capture = sessions
            .create_capture(&tx, "CS101", &photo, CaptureOptions::default())
            .unwrap();

        let jpeg = capture_thumbnail(&tx, capture.id).unwrap().unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT));
    }

    #[test]
    fn test_undecodable_photo_has_no_thumbnail() {
        let (mut conn, mut sessions) = setup(FakeProvider::default().with(b"class", &[&[1.0, 0.0]]));
        let tx = conn.transaction().unwrap();
        let capture = sessions
            .create_capture(&tx, "CS101", b"class", CaptureOptions::default())
            .unwrap();
        assert_eq!(capture_thumbnail(&tx, capture.id).unwrap(), None);
    }
}
