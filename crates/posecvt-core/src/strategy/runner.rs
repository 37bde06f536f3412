//! Subprocess runner for the embedded converter scripts.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::scripts::{ensure_scripts_deployed, scripts_dir, Script};
use crate::{ConvertError, Result};

/// Lines of stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 40;

static UNSUPPORTED_FLEX_OP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'tf\.([A-Za-z0-9_]+)' op is neither a custom op nor a flex op")
        .expect("flex op regex must compile")
});

static UNSUPPORTED_GENERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[Uu]nsupported (?:op|operator|onnx op)[: ]+'?([A-Za-z0-9_]+))|(?:\b([A-Za-z0-9_]+) is not (?:implemented|supported))")
        .expect("unsupported op regex must compile")
});

static MISSING_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"No module named '([A-Za-z0-9_.]+)'").expect("missing module regex must compile")
});

/// JSON line emitted by a converter script on stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptProgressLine {
    pub stage: String,
    #[serde(default)]
    pub message: Option<String>,
    /// Failure class on `stage == "error"` lines.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub library: Option<String>,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub output_size: Option<u64>,
}

impl ScriptProgressLine {
    fn is_error(&self) -> bool {
        self.stage == "error"
    }

    fn is_complete(&self) -> bool {
        self.stage == "complete"
    }
}

/// What a successful script run reported.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    /// Path from the `complete` line, if the script sent one.
    pub output_path: Option<PathBuf>,
}

/// Runs converter scripts with a fixed interpreter.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    python: String,
    work_dir: PathBuf,
}

impl ScriptRunner {
    pub fn new(python: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn scripts_dir(&self) -> PathBuf {
        scripts_dir(&self.work_dir)
    }

    /// Write the embedded scripts to the work directory if they are stale.
    pub fn deploy(&self) -> Result<PathBuf> {
        ensure_scripts_deployed(&self.work_dir)
    }

    /// Run `script` in `cwd` and wait for it to finish.
    ///
    /// The child is killed if the returned future is dropped, so callers can
    /// bound it with `tokio::time::timeout` or race it against cancellation.
    pub async fn run<I, S>(&self, script: Script, args: I, cwd: &Path) -> Result<ScriptOutcome>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let dir = self.deploy()?;
        let label = script.file_name();
        debug!("Running {} in {}", label, cwd.display());

        let mut child = Command::new(&self.python)
            .arg(dir.join(label))
            .args(args)
            .current_dir(cwd)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConvertError::DependencyUnavailable {
                library: self.python.clone(),
                diagnostic: format!("failed to start {label}: {e}"),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ConvertError::ConversionFailed {
            message: format!("{label}: stdout was not captured"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ConvertError::ConversionFailed {
            message: format!("{label}: stderr was not captured"),
        })?;

        let (lines, stderr_tail) =
            tokio::join!(read_progress(label, stdout), read_stderr_tail(label, stderr));

        let status = child.wait().await.map_err(|e| ConvertError::ConversionFailed {
            message: format!("{label} process error: {e}"),
        })?;

        let error_line = lines.iter().rev().find(|l| l.is_error());
        if !status.success() || error_line.is_some() {
            let exit = format!("{label} exited with status {}", status.code().unwrap_or(-1));
            return Err(classify_failure(error_line, &stderr_tail, &exit));
        }

        let done = lines.iter().rev().find(|l| l.is_complete());
        if let Some(size) = done.and_then(|l| l.output_size) {
            debug!("{} reported {} bytes written", label, size);
        }
        Ok(ScriptOutcome {
            output_path: done.and_then(|l| l.output_path.clone()),
        })
    }
}

async fn read_progress<R>(label: &str, stdout: R) -> Vec<ScriptProgressLine>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout).lines();
    let mut lines = Vec::new();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<ScriptProgressLine>(&line) {
                Ok(progress) => {
                    debug!(
                        "[{}] {}: {}",
                        label,
                        progress.stage,
                        progress.message.as_deref().unwrap_or("")
                    );
                    lines.push(progress);
                }
                Err(_) => debug!("[{}] {}", label, line),
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading {} stdout: {}", label, e);
                break;
            }
        }
    }
    lines
}

async fn read_stderr_tail<R>(label: &str, stderr: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                debug!("[{}] stderr: {}", label, line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error reading {} stderr: {}", label, e);
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}

/// Map a failed script run onto the conversion error taxonomy.
///
/// A classified `error` line wins; otherwise stderr is scanned for known
/// converter messages.
pub(crate) fn classify_failure(
    error_line: Option<&ScriptProgressLine>,
    stderr: &str,
    exit: &str,
) -> ConvertError {
    if let Some(line) = error_line {
        let message = line.message.clone().unwrap_or_else(|| exit.to_string());
        match line.kind.as_deref() {
            Some("unsupported_operator") => {
                return ConvertError::UnsupportedOperator {
                    operator: line.operator.clone().unwrap_or_else(|| "unknown".into()),
                    message,
                }
            }
            Some("malformed_input") => return ConvertError::MalformedInputArtifact { message },
            Some("missing_dependency") => {
                return ConvertError::DependencyUnavailable {
                    library: line.library.clone().unwrap_or_else(|| "unknown".into()),
                    diagnostic: message,
                }
            }
            _ => return ConvertError::ConversionFailed { message },
        }
    }

    if let Some(caps) = UNSUPPORTED_FLEX_OP.captures(stderr) {
        return ConvertError::UnsupportedOperator {
            operator: caps[1].to_string(),
            message: last_line(stderr, exit),
        };
    }
    if let Some(caps) = UNSUPPORTED_GENERIC.captures(stderr) {
        if let Some(op) = caps.get(1).or_else(|| caps.get(2)) {
            return ConvertError::UnsupportedOperator {
                operator: op.as_str().to_string(),
                message: last_line(stderr, exit),
            };
        }
    }
    if let Some(caps) = MISSING_MODULE.captures(stderr) {
        return ConvertError::DependencyUnavailable {
            library: caps[1].to_string(),
            diagnostic: last_line(stderr, exit),
        };
    }

    ConvertError::ConversionFailed {
        message: if stderr.trim().is_empty() {
            exit.to_string()
        } else {
            format!("{exit}: {}", last_line(stderr, exit))
        },
    }
}

fn last_line(stderr: &str, fallback: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
