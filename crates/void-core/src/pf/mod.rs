//! PF anchor ownership.
//!
//! [`PfManager`] owns the anchor file as the single durable projection of
//! the engine's desired state: it parses the file back into rules on
//! startup, and on every sync rewrites it atomically and asks the kernel to
//! reload the anchor through an injected [`RuleReloader`].

pub mod anchor;

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::fs_atomic::{self, AtomicWriteError};
use crate::rules::Rule;
use anchor::AnchorError;

/// Where the managed anchor lives unless configured otherwise.
pub const DEFAULT_ANCHOR_PATH: &str = "/etc/pf.anchors/void";

/// Anchor name registered with PF.
const ANCHOR_NAME: &str = "void";

/// The system rule-loader utility.
const PFCTL_PROGRAM: &str = "pfctl";

/// Group/world readable, user writable. pfctl runs as root but the file is
/// ordinary system configuration other tools may inspect.
const ANCHOR_FILE_MODE: u32 = 0o644;

/// Capability for invoking the external firewall-reload utility.
#[async_trait]
pub trait RuleReloader: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), ReloaderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReloaderError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
}

/// Production reloader: shells out via tokio's process support.
#[derive(Debug, Default)]
pub struct PfctlRunner;

#[async_trait]
impl RuleReloader for PfctlRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<(), ReloaderError> {
        debug!(program, ?args, "invoking rule loader");
        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|source| ReloaderError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if !status.success() {
            return Err(ReloaderError::Failed {
                program: program.to_string(),
                status,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PfError {
    #[error("failed to read anchor file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("anchor file is malformed: {0}")]
    Codec(#[from] AnchorError),

    #[error("failed to write anchor file: {0}")]
    Write(#[from] AtomicWriteError),

    #[error("rule reload failed: {0}")]
    Reload(#[from] ReloaderError),
}

/// Owner of the on-disk anchor file.
pub struct PfManager {
    anchor_path: PathBuf,
    reloader: Arc<dyn RuleReloader>,
}

impl PfManager {
    #[must_use]
    pub fn new(reloader: Arc<dyn RuleReloader>) -> Self {
        Self::with_anchor_path(DEFAULT_ANCHOR_PATH, reloader)
    }

    #[must_use]
    pub fn with_anchor_path(path: impl Into<PathBuf>, reloader: Arc<dyn RuleReloader>) -> Self {
        Self {
            anchor_path: path.into(),
            reloader,
        }
    }

    #[must_use]
    pub fn anchor_path(&self) -> &Path {
        &self.anchor_path
    }

    /// Reads and parses the anchor file. A missing file is first-run, not an
    /// error: the result is simply no rules.
    pub fn current_rules(&self) -> Result<Vec<Rule>, PfError> {
        let text = match std::fs::read_to_string(&self.anchor_path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PfError::Read {
                    path: self.anchor_path.clone(),
                    source,
                })
            }
        };
        Ok(anchor::parse(&text)?)
    }

    /// Projects `rules` onto disk and reloads the kernel anchor.
    ///
    /// The write is atomic; a reload failure is reported but the file is not
    /// rolled back, since it already represents desired state and the next
    /// sync retries the reload.
    pub async fn sync(&self, rules: &[Rule]) -> Result<(), PfError> {
        let rendered = anchor::render(rules);
        fs_atomic::atomic_write(&self.anchor_path, rendered.as_bytes(), ANCHOR_FILE_MODE)?;

        let args = vec![
            "-a".to_string(),
            ANCHOR_NAME.to_string(),
            "-f".to_string(),
            self.anchor_path.display().to_string(),
        ];
        self.reloader.run(PFCTL_PROGRAM, &args).await?;
        Ok(())
    }
}
