//! Embedding provider seam: photo bytes in, one vector per detected face out.

use crate::types::Embedding;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long an extractor may run before it is killed.
pub const DEFAULT_EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to run extractor {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("extractor {program} killed after {after:?}")]
    TimedOut { program: String, after: Duration },
    #[error("extractor exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("extractor output is not a JSON array of vectors: {0}")]
    BadOutput(#[from] serde_json::Error),
    #[error("extractor produced a {actual}-dim vector, expected {expected}")]
    UnexpectedDimension { expected: usize, actual: usize },
}

/// Source of face embeddings for a photo.
///
/// Returns zero, one or many vectors in detection order. The order carries no
/// meaning beyond arrival order for greedy assignment.
pub trait EmbeddingProvider {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ProviderError>;
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Box<P> {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ProviderError> {
        (**self).extract(image)
    }
}

/// Runs an external extractor for every photo.
///
/// The photo is written to the child's stdin; the child must print a JSON
/// array of float arrays (`[[0.1, ...], ...]`) on stdout and exit 0 within
/// the timeout. Stdin, stdout and stderr are serviced concurrently.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    expected_dim: Option<usize>,
    timeout: Duration,
}

impl CommandProvider {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            expected_dim: None,
            timeout: DEFAULT_EXTRACTOR_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reject vectors whose length differs from the model dimension.
    pub fn with_expected_dim(mut self, dim: usize) -> Self {
        self.expected_dim = Some(dim);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl EmbeddingProvider for CommandProvider {
    fn extract(&mut self, image: &[u8]) -> Result<Vec<Embedding>, ProviderError> {
        let spawn_err = |source| ProviderError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        let writer = child.stdin.take().map(|mut stdin| {
            let image = image.to_vec();
            thread::spawn(move || {
                // A child that exits without reading the whole photo closes
                // the pipe early; its exit status decides success.
                if let Err(err) = stdin.write_all(&image) {
                    tracing::debug!(error = %err, "extractor closed stdin early");
                }
            })
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait().map_err(spawn_err)? {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(err) = child.kill() {
                    tracing::warn!(error = %err, "failed to kill extractor");
                }
                let _ = child.wait();
                tracing::warn!(program = %self.program, timeout = ?self.timeout, "extractor timed out");
                return Err(ProviderError::TimedOut {
                    program: self.program.clone(),
                    after: self.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            return Err(ProviderError::Failed {
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        let raw: Vec<Vec<f32>> = serde_json::from_slice(&stdout)?;
        if let Some(expected) = self.expected_dim {
            if let Some(bad) = raw.iter().find(|v| v.len() != expected) {
                return Err(ProviderError::UnexpectedDimension {
                    expected,
                    actual: bad.len(),
                });
            }
        }

        tracing::debug!(
            program = %self.program,
            image_bytes = image.len(),
            faces = raw.len(),
            "extractor finished"
        );

        Ok(raw.into_iter().map(Embedding::new).collect())
    }
}

/// Read a child pipe to EOF on its own thread.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(err) = pipe.read_to_end(&mut buf) {
            tracing::debug!(error = %err, "extractor pipe read failed");
        }
        buf
    })
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandProvider {
        CommandProvider::new("sh", vec!["-c".into(), script.into()])
    }

    #[test]
    fn test_command_provider_parses_vectors() {
        let mut provider = sh("cat > /dev/null; echo '[[1.0, 0.0], [0.5, 0.5]]'");
        let faces = provider.extract(b"photo").unwrap();
        assert_eq!(faces, vec![Embedding::new(vec![1.0, 0.0]), Embedding::new(vec![0.5, 0.5])]);
    }

    #[test]
    fn test_command_provider_no_faces() {
        let mut provider = sh("cat > /dev/null; echo '[]'");
        assert!(provider.extract(b"photo").unwrap().is_empty());
    }

    #[test]
    fn test_command_provider_sees_photo_on_stdin() {
        // Emits the byte count of stdin as a one-element vector.
        let mut provider = sh("n=$(wc -c); echo \"[[$n]]\"");
        let faces = provider.extract(&[0u8; 7]).unwrap();
        assert_eq!(faces, vec![Embedding::new(vec![7.0])]);
    }

    #[test]
    fn test_command_provider_chatty_stderr_with_large_photo() {
        // More stderr than a pipe buffer holds, written before stdin is read.
        let mut provider = sh("head -c 262144 /dev/zero >&2; cat > /dev/null; echo '[]'");
        let photo = vec![0u8; 1 << 20];
        assert!(provider.extract(&photo).unwrap().is_empty());
    }

    #[test]
    fn test_command_provider_times_out() {
        let mut provider = sh("exec sleep 5").with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        match provider.extract(b"photo") {
            Err(ProviderError::TimedOut { after, .. }) => {
                assert_eq!(after, Duration::from_millis(200))
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_command_provider_nonzero_exit() {
        let mut provider = sh("echo 'model missing' >&2; exit 3");
        match provider.extract(b"photo") {
            Err(ProviderError::Failed { stderr, .. }) => assert_eq!(stderr, "model missing"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_command_provider_bad_json() {
        let mut provider = sh("cat > /dev/null; echo 'not json'");
        assert!(matches!(provider.extract(b"photo"), Err(ProviderError::BadOutput(_))));
    }

    #[test]
    fn test_command_provider_dimension_check() {
        let mut provider = sh("cat > /dev/null; echo '[[1.0, 0.0, 0.0]]'").with_expected_dim(2);
        assert!(matches!(
            provider.extract(b"photo"),
            Err(ProviderError::UnexpectedDimension { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_missing_program() {
        let mut provider = CommandProvider::new("/nonexistent/extractor", Vec::new());
        assert!(matches!(provider.extract(b"photo"), Err(ProviderError::Spawn { .. })));
    }
}
