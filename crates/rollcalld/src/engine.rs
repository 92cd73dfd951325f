use crate::config::Config;
use rollcall_core::{
    calibrate_threshold, ledger, roster, session, AttendanceError, Capture, CaptureId,
    CaptureOptions, CommandProvider, EmbeddingProvider, Embedding, ErrorLedger, Group, Identity,
    IdentityUpdate, MemberId, PresenceFilter, PresenceRecord, SessionManager, StoreError,
};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no embedding extractor configured (set ROLLCALL_EXTRACTOR)")]
    NoExtractor,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    pub fn is_user_facing(&self) -> bool {
        match self {
            Self::Attendance(err) => err.is_user_facing(),
            _ => false,
        }
    }
}

type Provider = Box<dyn EmbeddingProvider + Send>;

/// Work item executed on the engine thread.
type Job = Box<dyn FnOnce(&mut Engine) + Send>;

/// Row counts reported by `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub groups: i64,
    pub identities: i64,
    pub captures: i64,
}

/// State owned by the engine thread: the connection and the session manager.
pub struct Engine {
    conn: Connection,
    sessions: SessionManager<Provider>,
}

impl Engine {
    fn new(conn: Connection, provider: Provider, threshold: f32) -> Self {
        Self {
            conn,
            sessions: SessionManager::new(provider).with_default_threshold(threshold),
        }
    }

    /// Run `f` inside one IMMEDIATE transaction; commit only on success.
    fn write<T>(
        &mut self,
        f: impl FnOnce(&Transaction<'_>, &mut SessionManager<Provider>) -> Result<T, AttendanceError>,
    ) -> Result<T, EngineError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(AttendanceError::from)?;
        let value = f(&tx, &mut self.sessions)?;
        tx.commit().map_err(AttendanceError::from)?;
        Ok(value)
    }

    pub fn create_group(&mut self, code: &str, name: &str) -> Result<Group, EngineError> {
        self.write(|tx, _| roster::create_group(tx, code, name))
    }

    pub fn remove_group(&mut self, code: &str) -> Result<(), EngineError> {
        self.write(|tx, _| roster::remove_group(tx, code))
    }

    pub fn enroll(&mut self, key: &str, name: &str, photo: &[u8]) -> Result<Identity, EngineError> {
        self.write(|tx, sessions| sessions.enroll(tx, key, name, photo))
    }

    pub fn update_identity(&mut self, key: &str, update: IdentityUpdate) -> Result<(), EngineError> {
        self.write(|tx, sessions| sessions.update_identity(tx, key, update))
    }

    pub fn remove_identity(&mut self, key: &str) -> Result<(), EngineError> {
        self.write(|tx, _| roster::remove_identity(tx, key))
    }

    pub fn add_member(&mut self, group: &str, identity: &str) -> Result<MemberId, EngineError> {
        self.write(|tx, _| roster::add_member(tx, group, identity))
    }

    pub fn remove_member(&mut self, group: &str, identity: &str) -> Result<(), EngineError> {
        self.write(|tx, _| roster::remove_member(tx, group, identity))
    }

    pub fn create_capture(&mut self, group: &str, photo: &[u8]) -> Result<Capture, EngineError> {
        self.write(|tx, sessions| {
            sessions.create_capture(tx, group, photo, CaptureOptions::default())
        })
    }

    pub fn replace_capture(&mut self, capture_id: CaptureId, photo: &[u8]) -> Result<(), EngineError> {
        self.write(|tx, sessions| {
            sessions.replace_capture(tx, capture_id, photo, CaptureOptions::default())
        })
    }

    pub fn delete_capture(&mut self, capture_id: CaptureId) -> Result<(), EngineError> {
        self.write(|tx, _| session::delete_capture(tx, capture_id))
    }

    pub fn correct(
        &mut self,
        capture_id: CaptureId,
        member_id: MemberId,
        present: bool,
    ) -> Result<ErrorLedger, EngineError> {
        self.write(|tx, _| ledger::correct(tx, capture_id, member_id, present))
    }

    pub fn list_captures(&self, group: &str) -> Result<Vec<Capture>, EngineError> {
        Ok(session::list_captures(&self.conn, group)?)
    }

    pub fn presence(
        &self,
        capture_id: CaptureId,
        filter: &PresenceFilter,
    ) -> Result<Vec<PresenceRecord>, EngineError> {
        Ok(session::presence(&self.conn, capture_id, filter)?)
    }

    pub fn error_ledger(&self, capture_id: CaptureId) -> Result<ErrorLedger, EngineError> {
        Ok(ledger::error_ledger(&self.conn, capture_id)?)
    }

    pub fn thumbnail(&self, capture_id: CaptureId) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(session::capture_thumbnail(&self.conn, capture_id)?)
    }

    /// Highest pairwise similarity within the group's roster.
    pub fn calibrate(&self, group: &str) -> Result<f32, EngineError> {
        let vectors: Vec<Embedding> = roster::roster_vectors(&self.conn, group)?
            .into_iter()
            .map(|entry| entry.embedding)
            .collect();
        let threshold = calibrate_threshold(&vectors).map_err(AttendanceError::from)?;
        tracing::info!(group, roster = vectors.len(), threshold, "threshold calibrated");
        Ok(threshold)
    }

    pub fn default_threshold(&self) -> f32 {
        self.sessions.default_threshold()
    }

    pub fn stats(&self) -> Result<Stats, EngineError> {
        let stats = self
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM class_groups),
                        (SELECT COUNT(*) FROM identities),
                        (SELECT COUNT(*) FROM captures)",
                [],
                |row| {
                    Ok(Stats {
                        groups: row.get(0)?,
                        identities: row.get(1)?,
                        captures: row.get(2)?,
                    })
                },
            )
            .map_err(AttendanceError::from)?;
        Ok(stats)
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Job>,
}

impl EngineHandle {
    /// Run `f` on the engine thread and await its result.
    pub async fn run<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Engine) -> Result<T, EngineError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |engine| {
            let _ = reply_tx.send(f(engine));
        });
        self.tx
            .send(job)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the database (applying migrations) and builds the extractor
/// synchronously, so a bad config fails at startup rather than on the first
/// request.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let (program, args) = config
        .extractor
        .split_first()
        .ok_or(EngineError::NoExtractor)?;
    let mut provider = CommandProvider::new(program.clone(), args.to_vec())
        .with_timeout(Duration::from_secs(config.extractor_timeout_secs));
    if let Some(dim) = config.embedding_dim {
        provider = provider.with_expected_dim(dim);
    }
    tracing::info!(
        program = %provider.program(),
        dim = ?config.embedding_dim,
        timeout_secs = config.extractor_timeout_secs,
        "extractor configured"
    );

    let conn = rollcall_core::open_db(&config.db_path)?;
    spawn_with(conn, Box::new(provider), config.similarity_threshold)
}

fn spawn_with(
    conn: Connection,
    provider: Provider,
    threshold: f32,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<Job>(16);
    let mut engine = Engine::new(conn, provider, threshold);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(threshold, "engine thread started");
            while let Some(job) = rx.blocking_recv() {
                job(&mut engine);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
