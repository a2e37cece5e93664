//! Builder for executing external tool commands with timeout support.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Number of trailing stderr lines kept for error reporting.
const STDERR_TAIL: usize = 20;

/// Failure of an external tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{tool}: failed to spawn: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool}: I/O error: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool}: timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("{tool}: exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        /// Tail of stderr, trimmed.
        stderr: String,
    },
}

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    /// Captured standard error (lossy UTF-8). When stderr was streamed to a
    /// callback, only the trailing lines are kept.
    pub stderr: String,
}

impl ToolOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// A builder for constructing and executing external tool invocations.
///
/// Spawned processes are killed when the returned future is dropped, so an
/// in-flight call can be abandoned by dropping it.
///
/// # Example
///
/// ```no_run
/// use mf_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> Result<(), mf_av::ToolError> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "quiet", "-print_format", "json", "-show_format"])
///     .arg("/path/to/clip.mov")
///     .execute()
///     .await?;
/// println!("{}", output.stdout_lossy());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Execute the command, capturing stdout and stderr.
    pub async fn execute(&self) -> Result<ToolOutput, ToolError> {
        self.execute_with_stderr_callback(|_| {}).await
    }

    /// Execute the command, handing every stderr line to `on_line` as it
    /// arrives (for `-progress pipe:2` style reporting).
    pub async fn execute_with_stderr_callback(
        &self,
        mut on_line: impl FnMut(&str),
    ) -> Result<ToolOutput, ToolError> {
        let tool = self.program_name();
        tracing::debug!(tool = %tool, args = ?self.args, "Running tool");

        let mut child = self.command().spawn().map_err(|source| ToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;

        let mut stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let read_stdout = async {
                let mut buf = Vec::new();
                if let Some(out) = stdout.as_mut() {
                    out.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };

            let read_stderr = async {
                let mut tail: std::collections::VecDeque<String> =
                    std::collections::VecDeque::with_capacity(STDERR_TAIL);
                if let Some(err) = stderr {
                    // Tools echo container metadata verbatim, so stderr is
                    // not guaranteed to be UTF-8.
                    let mut segments = BufReader::new(err).split(b'\n');
                    while let Some(segment) = segments.next_segment().await? {
                        let line = String::from_utf8_lossy(&segment);
                        let line = line.trim_end_matches('\r').to_string();
                        on_line(&line);
                        if tail.len() == STDERR_TAIL {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
                Ok::<_, std::io::Error>(tail.into_iter().collect::<Vec<_>>().join("\n"))
            };

            let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };

        let (status, stdout, stderr) = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(done)) => done,
            Ok(Err(source)) => return Err(ToolError::Io { tool, source }),
            Err(_elapsed) => {
                return Err(ToolError::Timeout {
                    tool,
                    timeout: self.timeout,
                })
            }
        };

        if !status.success() {
            return Err(ToolError::Failed {
                tool,
                status,
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ToolOutput {
            status,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_echo() {
        let output = ToolCommand::new(PathBuf::from("echo"))
            .arg("hello")
            .execute()
            .await;

        match output {
            Ok(out) => {
                assert!(out.status.success());
                assert!(out.stdout_lossy().trim().contains("hello"));
            }
            Err(_) => {
                // Minimal environments may lack echo.
            }
        }
    }

    #[tokio::test]
    async fn execute_nonexistent_tool() {
        let result = ToolCommand::new(PathBuf::from("nonexistent_tool_xyz_12345"))
            .execute()
            .await;
        assert!(matches!(result, Err(ToolError::Spawn { .. })));
    }

    #[tokio::test]
    async fn timeout_fires() {
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute()
            .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("timed out"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn non_utf8_stderr_does_not_fail_the_run() {
        let mut seen = Vec::new();
        let result = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "printf 'title    : caf\\351\\n' >&2; printf ok"])
            .execute_with_stderr_callback(|line| seen.push(line.to_string()))
            .await;
        if let Err(ToolError::Spawn { .. }) = result {
            return;
        }
        let output = result.unwrap();
        assert_eq!(output.stdout_lossy(), "ok");
        assert_eq!(seen, vec!["title    : caf\u{fffd}"]);
    }

    #[tokio::test]
    async fn stderr_lines_reach_callback() {
        let mut seen = Vec::new();
        let result = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo one >&2; echo two >&2"])
            .execute_with_stderr_callback(|line| seen.push(line.to_string()))
            .await;
        if result.is_ok() {
            assert_eq!(seen, vec!["one", "two"]);
        }
    }

    #[tokio::test]
    async fn nonzero_exit_keeps_stderr_tail() {
        let result = ToolCommand::new(PathBuf::from("sh"))
            .args(["-c", "echo broken pipe >&2; exit 3"])
            .execute()
            .await;
        if let Err(ToolError::Failed { stderr, .. }) = result {
            assert_eq!(stderr, "broken pipe");
        }
    }
}
