//! Groups, enrolled identities and roster membership.
//!
//! Mutations take the caller's transaction; reads take any connection (a
//! `&Transaction` derefs to one).

use crate::codec;
use crate::error::{AttendanceError, Entity, Result};
use crate::provider::EmbeddingProvider;
use crate::store::{now_text, parse_timestamp};
use crate::types::{Embedding, Group, Identity, IdentityUpdate, MemberId, RosterEntry};
use rusqlite::{params, Connection, OptionalExtension, Transaction};

pub fn create_group(tx: &Transaction<'_>, code: &str, name: &str) -> Result<Group> {
    if group_exists(tx, code)? {
        return Err(AttendanceError::already_exists(Entity::Group, code));
    }
    tx.execute(
        "INSERT INTO class_groups (code, name) VALUES (?1, ?2)",
        params![code, name],
    )?;
    tracing::info!(group = code, "group created");
    Ok(Group {
        code: code.to_string(),
        name: name.to_string(),
    })
}

/// Delete a group with its roster and captures.
pub fn remove_group(tx: &Transaction<'_>, code: &str) -> Result<()> {
    let removed = tx.execute("DELETE FROM class_groups WHERE code = ?1", [code])?;
    if removed == 0 {
        return Err(AttendanceError::not_found(Entity::Group, code));
    }
    tracing::info!(group = code, "group removed");
    Ok(())
}

pub fn group_exists(conn: &Connection, code: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM class_groups WHERE code = ?1", [code], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Enroll a new identity from a photo that must show exactly one face.
pub fn enroll<P: EmbeddingProvider + ?Sized>(
    tx: &Transaction<'_>,
    provider: &mut P,
    key: &str,
    display_name: &str,
    photo: &[u8],
) -> Result<Identity> {
    if identity_exists(tx, key)? {
        return Err(AttendanceError::already_exists(Entity::Identity, key));
    }

    let embedding = single_face(provider, photo)?;
    tx.execute(
        "INSERT INTO identities (identity_key, display_name, embedding, enrolled_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![key, display_name, codec::encode(&embedding), now_text()],
    )?;

    tracing::info!(identity = key, dim = embedding.dim(), "identity enrolled");
    identity(tx, key)
}

/// Apply a partial identity update. A new photo replaces the stored
/// embedding wholesale.
pub fn update_identity<P: EmbeddingProvider + ?Sized>(
    tx: &Transaction<'_>,
    provider: &mut P,
    key: &str,
    update: IdentityUpdate,
) -> Result<()> {
    if !identity_exists(tx, key)? {
        return Err(AttendanceError::not_found(Entity::Identity, key));
    }

    // Extract first so a bad photo leaves the name untouched too.
    let embedding = match &update.photo {
        Some(photo) => Some(single_face(provider, photo)?),
        None => None,
    };

    if let Some(name) = &update.display_name {
        tx.execute(
            "UPDATE identities SET display_name = ?2 WHERE identity_key = ?1",
            params![key, name],
        )?;
    }
    if let Some(embedding) = &embedding {
        tx.execute(
            "UPDATE identities SET embedding = ?2, enrolled_at = ?3 WHERE identity_key = ?1",
            params![key, codec::encode(embedding), now_text()],
        )?;
        tracing::info!(identity = key, "identity re-enrolled");
    }
    Ok(())
}

/// Delete an identity and every roster membership it holds.
pub fn remove_identity(tx: &Transaction<'_>, key: &str) -> Result<()> {
    let removed = tx.execute("DELETE FROM identities WHERE identity_key = ?1", [key])?;
    if removed == 0 {
        return Err(AttendanceError::not_found(Entity::Identity, key));
    }
    tracing::info!(identity = key, "identity removed");
    Ok(())
}

pub fn identity(conn: &Connection, key: &str) -> Result<Identity> {
    let row = conn
        .query_row(
            "SELECT display_name, embedding, enrolled_at FROM identities WHERE identity_key = ?1",
            [key],
            |row| {
                let enrolled_at: String = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    parse_timestamp(2, &enrolled_at)?,
                ))
            },
        )
        .optional()?;

    let (display_name, blob, enrolled_at) =
        row.ok_or_else(|| AttendanceError::not_found(Entity::Identity, key))?;
    Ok(Identity {
        key: key.to_string(),
        display_name,
        embedding: codec::decode(&blob)?,
        enrolled_at,
    })
}

/// Reference embedding of one identity.
pub fn identity_vector(conn: &Connection, key: &str) -> Result<Embedding> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM identities WHERE identity_key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    let blob = blob.ok_or_else(|| AttendanceError::not_found(Entity::Identity, key))?;
    Ok(codec::decode(&blob)?)
}

/// Put an identity on a group's roster.
pub fn add_member(tx: &Transaction<'_>, group: &str, identity: &str) -> Result<MemberId> {
    if !group_exists(tx, group)? {
        return Err(AttendanceError::not_found(Entity::Group, group));
    }
    if !identity_exists(tx, identity)? {
        return Err(AttendanceError::not_found(Entity::Identity, identity));
    }
    if member_id(tx, group, identity)?.is_some() {
        return Err(AttendanceError::DuplicateMembership {
            group: group.to_string(),
            identity: identity.to_string(),
        });
    }

    tx.execute(
        "INSERT INTO roster_members (group_code, identity_key) VALUES (?1, ?2)",
        params![group, identity],
    )?;
    let id = tx.last_insert_rowid();
    tracing::info!(group, identity, member_id = id, "roster member added");
    Ok(id)
}

/// Take an identity off a group's roster. Its presence records go with it.
pub fn remove_member(tx: &Transaction<'_>, group: &str, identity: &str) -> Result<()> {
    let removed = tx.execute(
        "DELETE FROM roster_members WHERE group_code = ?1 AND identity_key = ?2",
        params![group, identity],
    )?;
    if removed == 0 {
        return Err(AttendanceError::not_found(
            Entity::RosterMember,
            format!("{identity} in {group}"),
        ));
    }
    tracing::info!(group, identity, "roster member removed");
    Ok(())
}

/// Membership id of `identity` in `group`, if enrolled there.
pub fn member_id(conn: &Connection, group: &str, identity: &str) -> Result<Option<MemberId>> {
    Ok(conn
        .query_row(
            "SELECT id FROM roster_members WHERE group_code = ?1 AND identity_key = ?2",
            params![group, identity],
            |row| row.get(0),
        )
        .optional()?)
}

/// Every member of `group` with its reference embedding, in enrollment order.
pub fn roster_vectors(conn: &Connection, group: &str) -> Result<Vec<RosterEntry>> {
    if !group_exists(conn, group)? {
        return Err(AttendanceError::not_found(Entity::Group, group));
    }

    let mut stmt = conn.prepare(
        "SELECT m.id, m.identity_key, i.embedding
         FROM roster_members m
         JOIN identities i ON i.identity_key = m.identity_key
         WHERE m.group_code = ?1
         ORDER BY m.id",
    )?;
    let rows = stmt
        .query_map([group], |row| {
            Ok((
                row.get::<_, MemberId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(member_id, identity, blob)| -> Result<RosterEntry> {
            Ok(RosterEntry {
                member_id,
                identity,
                embedding: codec::decode(&blob)?,
            })
        })
        .collect()
}

fn identity_exists(conn: &Connection, key: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM identities WHERE identity_key = ?1", [key], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn single_face<P: EmbeddingProvider + ?Sized>(provider: &mut P, photo: &[u8]) -> Result<Embedding> {
    let mut faces = provider.extract(photo)?;
    if faces.len() != 1 {
        return Err(AttendanceError::AmbiguousFace { faces: faces.len() });
    }
    Ok(faces.remove(0))
}
