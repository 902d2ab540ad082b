//! Locating and running per-repository automation scripts
//!
//! Scripts live at `{scripts_path}/{organization}/{repository}/{event}.sh`
//! and `{scripts_path}/{organization}/{repository}/{event}.{ext}`, where `ext`
//! belongs to the configured [`Interpreter`]. Both run when both exist, shell
//! script first.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::webhook::{EventData, EventKind};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Program used to run the non-shell script candidate
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Interpreter {
    pub program: String,
    /// Script file extension, without the leading dot.
    pub extension: String,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            extension: "js".to_string(),
        }
    }
}

/// Why a script could not be run to completion
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed while waiting for script: {0}")]
    Wait(#[source] io::Error),

    #[error("Script timed out after {0:?}")]
    TimedOut(Duration),
}

/// Outcome of one script invocation
#[derive(Debug)]
pub struct ScriptResult {
    pub script: PathBuf,
    /// Set when the script could not be launched, timed out, or exited unsuccessfully.
    pub failed: bool,
    /// Set when the script could not be launched, waited on, or was timed out;
    /// `None` when it ran to exit, whatever its exit status.
    pub error: Option<ScriptError>,
    /// `None` when the script did not exit normally.
    pub exit_code: Option<i32>,
    /// stdout and stderr interleaved in arrival order.
    pub combined_output: String,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// What a script is being run for; exported to the script's environment.
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub organization: &'a str,
    pub repository: &'a str,
    pub event: EventKind,
    pub data: Option<&'a EventData>,
}

impl ScriptContext<'_> {
    fn env_vars(&self) -> Vec<(&'static str, &str)> {
        let mut vars = vec![
            ("PIPELINER_EVENT", self.event.as_str()),
            ("PIPELINER_ORGANIZATION", self.organization),
            ("PIPELINER_REPOSITORY", self.repository),
        ];
        if let Some(data) = self.data {
            let optional = [
                ("PIPELINER_BRANCH", data.branch()),
                ("PIPELINER_BASE_BRANCH", data.base_branch()),
                ("PIPELINER_TAG", data.tag()),
            ];
            vars.extend(
                optional
                    .into_iter()
                    .filter_map(|(name, value)| value.map(|v| (name, v))),
            );
        }
        vars
    }
}

/// Finds and runs the scripts registered for an event
#[derive(Debug, Clone)]
pub struct ScriptDispatcher {
    scripts_path: PathBuf,
    interpreter: Interpreter,
    timeout: Option<Duration>,
}

impl ScriptDispatcher {
    pub fn new(scripts_path: impl Into<PathBuf>) -> Self {
        Self {
            scripts_path: scripts_path.into(),
            interpreter: Interpreter::default(),
            timeout: None,
        }
    }

    pub fn with_interpreter(mut self, interpreter: Interpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    /// Kills scripts running longer than `timeout`. Without one, a hung
    /// script blocks every later webhook.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn scripts_path(&self) -> &Path {
        &self.scripts_path
    }

    /// Directory holding the scripts for one repository, if the names are
    /// usable as single path components.
    pub fn repository_dir(&self, organization: &str, repository: &str) -> Option<PathBuf> {
        if !is_plain_component(organization) || !is_plain_component(repository) {
            return None;
        }
        Some(self.scripts_path.join(organization).join(repository))
    }

    /// Runs every existing script for the event, in order, and returns one
    /// result per script. A missing script is skipped silently.
    pub async fn dispatch(&self, context: ScriptContext<'_>) -> Vec<ScriptResult> {
        let Some(repo_dir) = self.repository_dir(context.organization, context.repository) else {
            warn!(
                "Refusing script lookup for unsafe path '{}/{}'",
                context.organization, context.repository
            );
            return Vec::new();
        };

        let shell_script = repo_dir.join(format!("{}.sh", context.event));
        let interpreted_script =
            repo_dir.join(format!("{}.{}", context.event, self.interpreter.extension));

        let shell_exists = is_file(&shell_script).await;
        let interpreted_exists = is_file(&interpreted_script).await;

        if !shell_exists && !interpreted_exists {
            debug!("No scripts for {} in {:?}", context.event, repo_dir);
            return Vec::new();
        }

        let env = context.env_vars();
        let mut results = Vec::with_capacity(2);

        if shell_exists {
            let mut command = Command::new(&shell_script);
            command.envs(env.iter().copied());
            results.push(self.run(command, &shell_script).await);
        }

        if interpreted_exists {
            let mut command = Command::new(&self.interpreter.program);
            command.arg(&interpreted_script).envs(env.iter().copied());
            results.push(self.run(command, &interpreted_script).await);
        }

        results
    }

    async fn run(&self, mut command: Command, script: &Path) -> ScriptResult {
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let started_at = Utc::now();
        let start = Instant::now();

        info!("Running script {:?}", script);

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                warn!("Failed to launch '{}': {}", program, source);
                return ScriptResult {
                    script: script.to_path_buf(),
                    failed: true,
                    error: Some(ScriptError::Launch { program, source }),
                    exit_code: None,
                    combined_output: String::new(),
                    stdout: String::new(),
                    stderr: String::new(),
                    started_at,
                    duration: start.elapsed(),
                };
            }
        };

        let captured = capture(child, self.timeout).await;

        let (exit_code, error) = match captured.status {
            Ok(status) => (status.code(), None),
            Err(error) => (None, Some(error)),
        };
        let failed = error.is_some() || exit_code != Some(0);

        let result = ScriptResult {
            script: script.to_path_buf(),
            failed,
            error,
            exit_code,
            combined_output: String::from_utf8_lossy(&captured.combined).into_owned(),
            stdout: String::from_utf8_lossy(&captured.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&captured.stderr).into_owned(),
            started_at,
            duration: start.elapsed(),
        };

        if result.failed {
            warn!(
                "Script {:?} failed (exit code {:?}) after {:?}",
                script, result.exit_code, result.duration
            );
        } else {
            info!("Script {:?} finished after {:?}", script, result.duration);
        }
        result
    }
}

struct Captured {
    status: Result<ExitStatus, ScriptError>,
    combined: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Reads both pipes until they close, then waits for the child to exit.
/// Past `limit` the child is killed and whatever output arrived is kept.
async fn capture(mut child: Child, limit: Option<Duration>) -> Captured {
    let mut combined = Vec::new();
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut stdout_buf = [0u8; READ_CHUNK_SIZE];
    let mut stderr_buf = [0u8; READ_CHUNK_SIZE];

    let expired = async move {
        match limit {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);
    let mut timed_out = None;

    while timed_out.is_none() && (stdout.is_some() || stderr.is_some()) {
        tokio::select! {
            n = read_chunk(&mut stdout, &mut stdout_buf), if stdout.is_some() => match n {
                Some(n) => {
                    stdout_bytes.extend_from_slice(&stdout_buf[..n]);
                    combined.extend_from_slice(&stdout_buf[..n]);
                }
                None => stdout = None,
            },
            n = read_chunk(&mut stderr, &mut stderr_buf), if stderr.is_some() => match n {
                Some(n) => {
                    stderr_bytes.extend_from_slice(&stderr_buf[..n]);
                    combined.extend_from_slice(&stderr_buf[..n]);
                }
                None => stderr = None,
            },
            limit = &mut expired => timed_out = Some(limit),
        }
    }

    // A script may close its pipes and keep running.
    if timed_out.is_none() {
        tokio::select! {
            status = child.wait() => {
                return Captured {
                    status: status.map_err(ScriptError::Wait),
                    combined,
                    stdout: stdout_bytes,
                    stderr: stderr_bytes,
                };
            }
            limit = &mut expired => timed_out = Some(limit),
        }
    }

    if let Err(e) = child.kill().await {
        debug!("Failed to kill timed out script: {}", e);
    }
    Captured {
        status: Err(ScriptError::TimedOut(timed_out.unwrap_or_default())),
        combined,
        stdout: stdout_bytes,
        stderr: stderr_bytes,
    }
}

/// Reads the next chunk, returning `None` at end of stream or on a read error.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> Option<usize> {
    let reader = reader.as_mut()?;
    match reader.read(buf).await {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(e) => {
            debug!("Stopped reading script output: {}", e);
            None
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

fn is_plain_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains('\0')
}
