//! Slicing engine adapter.
//!
//! Runs the external slicer as a subprocess with:
//! - A fixed argument vector (no shell, paths passed as discrete arguments)
//! - Bounded capture of stdout and stderr
//! - Its own process group, killed as a whole on timeout, on exit and on drop
//! - A wall-clock timeout on the engine's own exit, not on pipe draining

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Default per-stream capture cap (64KB).
pub const DEFAULT_OUTPUT_CAP: usize = 64 * 1024;

/// Default invocation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// How long to keep reading engine output after the engine has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Placeholder replaced by the input model path.
const INPUT_PLACEHOLDER: &str = "{input}";

/// Placeholder replaced by the output toolpath path.
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Captured process output, each stream truncated to the configured cap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub stdout: String,
    pub stderr: String,
}

/// How an engine invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SliceOutcome {
    /// Exit code zero and the artifact exists.
    Success {
        artifact_path: PathBuf,
        capture: Capture,
    },
    /// Non-zero exit, death by signal, or a zero exit that produced nothing.
    Failure {
        exit_code: Option<i32>,
        capture: Capture,
    },
    /// Killed after exceeding the timeout. Partial output is discarded.
    Timeout { after: Duration },
}

/// Something that turns a model file into a toolpath file.
#[async_trait]
pub trait Slicer: Send + Sync {
    async fn slice(&self, input: &Path, output: &Path) -> Result<SliceOutcome, EngineError>;
}

/// One token of the engine argument template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ArgToken {
    Literal(String),
    Input,
    Output,
}

impl ArgToken {
    fn parse(token: &str) -> Self {
        match token {
            INPUT_PLACEHOLDER => Self::Input,
            OUTPUT_PLACEHOLDER => Self::Output,
            other => Self::Literal(other.to_string()),
        }
    }
}

/// Production slicer: an external executable.
#[derive(Debug, Clone)]
pub struct CommandSlicer {
    program: PathBuf,
    args: Vec<ArgToken>,
    timeout: Duration,
    output_cap: usize,
}

impl CommandSlicer {
    /// Create a slicer for `program`.
    ///
    /// Each template token is one argument; a token equal to `{input}` or
    /// `{output}` is replaced by the corresponding path. If the template
    /// mentions neither, the two paths are appended as `input output`.
    pub fn new<I, S>(program: impl Into<PathBuf>, template: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args: Vec<ArgToken> = template
            .into_iter()
            .map(|t| ArgToken::parse(t.as_ref()))
            .collect();
        if !args.iter().any(|a| matches!(a, ArgToken::Input | ArgToken::Output)) {
            args.push(ArgToken::Input);
            args.push(ArgToken::Output);
        }

        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_TIMEOUT,
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }

    /// Set the invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the per-stream capture cap in bytes.
    pub fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = cap;
        self
    }

    /// Render the argument vector for one invocation.
    fn render_args(&self, input: &Path, output: &Path) -> Vec<std::ffi::OsString> {
        self.args
            .iter()
            .map(|token| match token {
                ArgToken::Literal(s) => s.into(),
                ArgToken::Input => input.as_os_str().to_owned(),
                ArgToken::Output => output.as_os_str().to_owned(),
            })
            .collect()
    }
}

#[async_trait]
impl Slicer for CommandSlicer {
    async fn slice(&self, input: &Path, output: &Path) -> Result<SliceOutcome, EngineError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.render_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        let mut group = ProcessGroup::of(&child);
        debug!(pid = ?child.id(), program = %self.program.display(), "Slicing engine started");

        // Drain both pipes concurrently so the engine never blocks on a full pipe.
        let cap = self.output_cap;
        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), cap));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(EngineError::Wait(e));
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "Slicing engine timed out, killing process group");
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out slicing engine");
                }
                stdout_task.abort();
                stderr_task.abort();
                return Ok(SliceOutcome::Timeout { after: self.timeout });
            }
        };

        // Helpers the engine left running would keep the pipes open.
        group.kill();
        let capture = Capture {
            stdout: join_capture(stdout_task).await,
            stderr: join_capture(stderr_task).await,
        };

        if !status.success() {
            return Ok(SliceOutcome::Failure {
                exit_code: status.code(),
                capture,
            });
        }

        match tokio::fs::metadata(output).await {
            Ok(meta) if meta.is_file() => Ok(SliceOutcome::Success {
                artifact_path: output.to_path_buf(),
                capture,
            }),
            _ => {
                warn!("Slicing engine exited successfully without producing a toolpath");
                Ok(SliceOutcome::Failure {
                    exit_code: status.code(),
                    capture,
                })
            }
        }
    }
}

/// The engine's process group. Every process in it is killed when this is
/// dropped, which covers a request abandoned mid-slice.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|id| i32::try_from(id).ok()),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "Failed to kill slicing engine process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

/// Wait a bounded time for a reader task once the engine has exited. A
/// descendant that escaped the process group can hold the pipe open forever.
async fn join_capture(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            warn!(grace = ?DRAIN_GRACE, "Engine output still open after exit, discarding");
            task.abort();
            String::new()
        }
    }
}

/// Keep the first `cap` bytes of a stream and discard the rest.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };

    let mut buf = Vec::new();
    if let Err(e) = (&mut reader).take(cap as u64).read_to_end(&mut buf).await {
        debug!(error = %e, "Engine output stream read failed");
    }
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Write a shell script into `dir`; it is run through `/bin/sh` so the
    /// test never execs a file that was just written.
    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("{body}\n")).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn sh(script: &str, template: &[&str]) -> CommandSlicer {
        let mut args = vec![script];
        args.extend_from_slice(template);
        CommandSlicer::new("/bin/sh", args)
    }

    #[tokio::test]
    async fn test_exit_zero_with_artifact_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            "ok.sh",
            "printf 'G1 X1 E1\\n' > \"$2\"\nprintf 'sliced'",
        );
        let input = dir.path().join("in.stl");
        let output = dir.path().join("out.gcode");
        std::fs::write(&input, b"solid").unwrap();

        let slicer = sh(&engine, &["{input}", "{output}"]);
        let outcome = slicer.slice(&input, &output).await.unwrap();

        match outcome {
            SliceOutcome::Success {
                artifact_path,
                capture,
            } => {
                assert_eq!(artifact_path, output);
                assert_eq!(capture.stdout, "sliced");
                assert_eq!(std::fs::read_to_string(&output).unwrap(), "G1 X1 E1\n");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(dir.path(), "boom.sh", "printf boom >&2\nexit 1");

        let outcome = sh(&engine, &[])
            .slice(&dir.path().join("in.stl"), &dir.path().join("out.gcode"))
            .await
            .unwrap();

        match outcome {
            SliceOutcome::Failure { exit_code, capture } => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(capture.stderr, "boom");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exit_zero_without_artifact_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(dir.path(), "lazy.sh", "exit 0");

        let outcome = sh(&engine, &["{input}", "{output}"])
            .slice(&dir.path().join("in.stl"), &dir.path().join("out.gcode"))
            .await
            .unwrap();
        assert!(matches!(outcome, SliceOutcome::Failure { exit_code: Some(0), .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(dir.path(), "slow.sh", "exec sleep 10");
        let slicer = sh(&engine, &[]).with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let outcome = slicer
            .slice(&dir.path().join("in.stl"), &dir.path().join("out.gcode"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SliceOutcome::Timeout {
                after: Duration::from_millis(200)
            }
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_kills_engine_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            "wrapper.sh",
            "( sleep 1; printf late > \"$2\" ) &\nwait",
        );
        let marker = dir.path().join("out.gcode");
        let slicer = sh(&engine, &["{input}", "{output}"]).with_timeout(Duration::from_millis(200));

        let outcome = slicer
            .slice(&dir.path().join("in.stl"), &marker)
            .await
            .unwrap();
        assert!(matches!(outcome, SliceOutcome::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "helper outlived the timed out engine");
    }

    #[tokio::test]
    async fn test_background_helper_does_not_turn_success_into_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            "forks.sh",
            "sleep 3 &\nprintf 'G1 X1 E1\\n' > \"$2\"\nexit 0",
        );
        let output = dir.path().join("out.gcode");
        let slicer = sh(&engine, &["{input}", "{output}"]).with_timeout(Duration::from_secs(1));

        let started = std::time::Instant::now();
        let outcome = slicer
            .slice(&dir.path().join("in.stl"), &output)
            .await
            .unwrap();

        assert!(
            matches!(outcome, SliceOutcome::Success { .. }),
            "got {outcome:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_slice_kills_engine() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("engine.pid");
        let engine = script(dir.path(), "hang.sh", "echo $$ > \"$1\"\nexec sleep 10");
        let slicer = sh(&engine, &["{input}"]);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            slicer.slice(&pid_file, &dir.path().join("out.gcode")),
        )
        .await;
        assert!(abandoned.is_err());

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(exits_soon(pid).await, "engine {pid} outlived its request");
    }

    #[tokio::test]
    async fn test_dropped_slice_kills_engine_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            "wrapper.sh",
            "( sleep 1; printf late > \"$2\" ) &\nwait",
        );
        let marker = dir.path().join("out.gcode");
        let slicer = sh(&engine, &["{input}", "{output}"]);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(200),
            slicer.slice(&dir.path().join("in.stl"), &marker),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "helper outlived the dropped request");
    }

    /// Poll `/proc` until `pid` is gone. A zombie awaiting its reaper counts.
    #[cfg(target_os = "linux")]
    async fn exits_soon(pid: u32) -> bool {
        for _ in 0..40 {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Err(_) => return true,
                Ok(stat) => {
                    let state = stat.rsplit(')').next().unwrap_or("").trim_start();
                    if state.starts_with('Z') {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let slicer = CommandSlicer::new("/nonexistent/slicer", Vec::<String>::new());
        let result = slicer
            .slice(Path::new("/tmp/in.stl"), Path::new("/tmp/out.gcode"))
            .await;
        assert!(matches!(result, Err(EngineError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            "chatty.sh",
            "i=0\nwhile [ $i -lt 2000 ]; do printf '0123456789' >&2; i=$((i+1)); done\nexit 3",
        );
        let slicer = sh(&engine, &[]).with_output_cap(100);

        let outcome = slicer
            .slice(&dir.path().join("in.stl"), &dir.path().join("out.gcode"))
            .await
            .unwrap();
        match outcome {
            SliceOutcome::Failure { exit_code, capture } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(capture.stderr.len(), 100);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_paths_are_discrete_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let engine = script(
            dir.path(),
            "args.sh",
            "for a in \"$@\"; do printf '%s\\n' \"$a\"; done\nexit 1",
        );
        let input = dir.path().join("odd name; rm -rf x.stl");
        let output = dir.path().join("$(whoami).gcode");
        let slicer = sh(&engine, &["--export-gcode", "{input}", "--output", "{output}"]);

        let outcome = slicer.slice(&input, &output).await.unwrap();
        let SliceOutcome::Failure { capture, .. } = outcome else {
            panic!("expected failure");
        };
        let lines: Vec<&str> = capture.stdout.lines().collect();
        assert_eq!(
            lines,
            vec![
                "--export-gcode",
                input.to_str().unwrap(),
                "--output",
                output.to_str().unwrap(),
            ]
        );
    }

    #[test]
    fn test_template_without_placeholders_appends_paths() {
        let slicer = CommandSlicer::new("engine", ["--quiet"]);
        let args = slicer.render_args(Path::new("/a.stl"), Path::new("/b.gcode"));
        assert_eq!(args, vec!["--quiet", "/a.stl", "/b.gcode"]);
    }
}
