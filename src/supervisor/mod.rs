//! Supervision of one external encode or burn invocation.
//!
//! The supervisor spawns the tool, reads its combined stdout/stderr line by
//! line (splitting on `\r` as well, since encoders redraw their status line),
//! reports progress, honours cancellation and classifies the exit status.
//! Any non-success outcome removes the partial output artifact.

pub mod progress;

pub use progress::{ProgressSample, parse_progress_line};

use crate::config::ProcessingConfig;
use crate::error::ProcessError;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Output lines kept for error messages
const TAIL_LINES: usize = 5;

/// Longest output line kept; longer ones are dropped up to the next delimiter
const MAX_LINE_BYTES: usize = 64 * 1024;

/// A fully-built external tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Artifact the invocation writes, removed on any non-success outcome
    pub output: Option<PathBuf>,
    /// Short name used in logs
    pub label: String,
}

impl SupervisedCommand {
    pub fn new(program: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output: None,
            label: label.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// How a finished process is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    /// Killed by SIGKILL, which the host does when memory runs out
    OutOfMemory(i32),
    Failure(i32),
}

/// Classify a raw exit code: 0 succeeds, -9/137 are out-of-memory kills
pub fn classify_exit_code(code: i32) -> ExitClass {
    match code {
        0 => ExitClass::Success,
        -9 | 137 => ExitClass::OutOfMemory(code),
        other => ExitClass::Failure(other),
    }
}

/// Exit code, with signal terminations reported as the negated signal
fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

enum Event {
    Cancelled,
    Line(Option<Bytes>),
}

/// Runs external processes with progress reporting and cooperative cancellation
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace_period: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(Duration::from_millis(config.grace_period_ms))
    }

    /// Run `command` to completion.
    ///
    /// `on_progress` is invoked for every line carrying an elapsed-time
    /// marker. `cancel` is checked before every line and also awaited while
    /// the tool is silent, so a cancel request interrupts the process within
    /// the grace period.
    pub async fn run<F>(
        &self,
        command: &SupervisedCommand,
        duration_hint: f64,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError>
    where
        F: FnMut(ProgressSample) + Send,
    {
        let result = self
            .supervise(command, duration_hint, on_progress, cancel)
            .await;

        if let Err(ref e) = result {
            if let Some(output) = &command.output
                && !matches!(e, ProcessError::MissingOutput(_))
            {
                remove_partial_output(output).await;
            }
            match e {
                ProcessError::Cancelled => info!("{} cancelled", command.label),
                other => warn!("{} failed: {}", command.label, other),
            }
        }

        result
    }

    async fn supervise<F>(
        &self,
        command: &SupervisedCommand,
        duration_hint: f64,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError>
    where
        F: FnMut(ProgressSample) + Send,
    {
        if cancel.is_cancelled() {
            return Err(ProcessError::Cancelled);
        }

        debug!("Running {}: {}", command.label, command.command_line());

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|s| output_lines(s, command.label.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|s| output_lines(s, command.label.clone()));
        let mut lines = stream::select(
            stream::iter(stdout).flatten(),
            stream::iter(stderr).flatten(),
        );

        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

        loop {
            if cancel.is_cancelled() {
                return Err(self.terminate(&mut child, command).await);
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                line = lines.next() => Event::Line(line),
            };

            match event {
                Event::Cancelled => return Err(self.terminate(&mut child, command).await),
                Event::Line(None) => break,
                Event::Line(Some(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let line = text.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_progress_line(line) {
                        Some(parsed) => on_progress(ProgressSample {
                            elapsed: parsed.elapsed,
                            duration: duration_hint,
                            speed: parsed.speed,
                        }),
                        None => {
                            trace!("{}: {}", command.label, line);
                            if tail.len() == TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line.to_string());
                        }
                    }
                }
            }
        }

        // Both streams are closed; the process may still be shutting down.
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.terminate(&mut child, command).await),
            status = child.wait() => status?,
        };

        match classify_exit_code(exit_code(&status)) {
            ExitClass::Success => {
                if let Some(output) = &command.output
                    && !tokio::fs::try_exists(output).await.unwrap_or(false)
                {
                    return Err(ProcessError::MissingOutput(output.clone()));
                }
                debug!("{} finished", command.label);
                Ok(())
            }
            ExitClass::OutOfMemory(code) => Err(ProcessError::OutOfMemory { code }),
            ExitClass::Failure(code) => Err(ProcessError::Exit {
                code,
                tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
            }),
        }
    }

    /// Ask the process to stop, force-kill it after the grace period
    async fn terminate(&self, child: &mut Child, command: &SupervisedCommand) -> ProcessError {
        info!("Stopping {} after cancel request", command.label);
        request_stop(child);

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, killing it",
                    command.label, self.grace_period
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", command.label, e);
                }
            }
        }

        ProcessError::Cancelled
    }
}

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), b"\n".to_vec(), MAX_LINE_BYTES)
}

/// Lines of one output pipe. The pipe is drained to the end even when a line
/// overflows, so the child never blocks on a full pipe.
fn output_lines<R>(reader: R, label: String) -> BoxStream<'static, Bytes>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let framed = FramedRead::new(reader, line_codec());
    stream::unfold((framed, label), |(mut framed, label)| async move {
        // FramedRead ends the stream once after a decode error, then resumes
        let mut resuming = false;
        loop {
            match framed.next().await {
                Some(Ok(line)) => return Some((line, (framed, label))),
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    warn!("{}: dropped an output line over {} bytes", label, MAX_LINE_BYTES);
                    resuming = true;
                }
                Some(Err(e)) => {
                    warn!("Failed to read output of {}: {}", label, e);
                    return None;
                }
                None if resuming => resuming = false,
                None => return None,
            }
        }
    })
    .boxed()
}

/// Graceful termination request (SIGTERM on unix)
#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", pid, e);
            }
        }
        None => debug!("Process already reaped"),
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.start_kill();
}

async fn remove_partial_output(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn sh(script: &str, output: Option<&Path>) -> SupervisedCommand {
        let mut cmd = SupervisedCommand::new("/bin/sh", "test").arg("-c").arg(script);
        if let Some(output) = output {
            cmd = cmd.arg("sh").arg(output.to_string_lossy().to_string());
            cmd = cmd.output(output);
        }
        cmd
    }

    #[test]
    fn test_exit_classification() {
        assert_eq!(classify_exit_code(0), ExitClass::Success);
        assert_eq!(classify_exit_code(-9), ExitClass::OutOfMemory(-9));
        assert_eq!(classify_exit_code(137), ExitClass::OutOfMemory(137));
        assert_eq!(classify_exit_code(1), ExitClass::Failure(1));
        assert_eq!(classify_exit_code(-15), ExitClass::Failure(-15));
    }

    #[tokio::test]
    async fn test_progress_lines_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let script = r#"printf 'frame=1 time=00:00:30.00 speed=2.0x\rframe=2 time=00:01:00.00 speed=2.0x\r' >&2
echo "no progress here"
echo "time=00:01:23.45" >&2
printf done > "$1""#;

        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let result = ProcessSupervisor::default()
            .run(
                &sh(script, Some(&out)),
                300.0,
                move |s| sink.lock().unwrap().push(s),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_ok(), "{:?}", result);
        assert!(out.exists());
        let samples = samples.lock().unwrap();
        let percents: Vec<_> = samples.iter().map(|s| s.percentage()).collect();
        assert_eq!(percents, vec![Some(10), Some(20), Some(27)]);
        assert!((samples[2].elapsed - 83.45).abs() < 1e-9);
        assert_eq!(samples[0].speed, Some(2.0));
    }

    #[tokio::test]
    async fn test_overlong_output_line_is_dropped_and_reading_continues() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        // Far more than a pipe buffer without a delimiter, then a progress line
        let script = r#"head -c 300000 /dev/zero | tr '\0' 'a' >&2
printf '\ntime=00:00:30.00 speed=1.0x\n' >&2
head -c 300000 /dev/zero | tr '\0' 'b'
printf done > "$1""#;

        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            ProcessSupervisor::default().run(
                &sh(script, Some(&out)),
                60.0,
                move |s| sink.lock().unwrap().push(s.percentage()),
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("supervisor stalled on a long line");

        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(*samples.lock().unwrap(), vec![Some(50)]);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "done");
    }

    #[test]
    fn test_line_codec_is_bounded() {
        use tokio_util::codec::Decoder;

        let mut codec = line_codec();
        let mut buf = bytes::BytesMut::from(vec![b'x'; MAX_LINE_BYTES + 1].as_slice());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)
        ));
        buf.extend_from_slice(b"tail\nnext\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(&b"next"[..]));
    }

    #[tokio::test]
    async fn test_generic_failure_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let script = "printf partial > \"$1\"; echo 'Conversion failed!' >&2; exit 1";

        let err = ProcessSupervisor::default()
            .run(&sh(script, Some(&out)), 0.0, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ProcessError::Exit { code, tail } => {
                assert_eq!(code, 1);
                assert!(tail.contains("Conversion failed!"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_exit_137_is_out_of_memory() {
        let err = ProcessSupervisor::default()
            .run(&sh("exit 137", None), 0.0, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::OutOfMemory { code: 137 }));
    }

    #[tokio::test]
    async fn test_sigkill_is_out_of_memory() {
        let err = ProcessSupervisor::default()
            .run(&sh("kill -9 $$", None), 0.0, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::OutOfMemory { code: -9 }));
    }

    #[tokio::test]
    async fn test_missing_output_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("never-written.mp4");
        let err = ProcessSupervisor::default()
            .run(&sh("exit 0", Some(&out)), 0.0, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::MissingOutput(_)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let cmd = SupervisedCommand::new("/nonexistent/encoder", "missing");
        let err = ProcessSupervisor::default()
            .run(&cmd, 0.0, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_cancel_stops_process_and_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let script = "printf partial > \"$1\"; while true; do echo 'time=00:00:01.00' >&2; sleep 0.05; done";

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = ProcessSupervisor::new(Duration::from_millis(200))
            .run(&sh(script, Some(&out)), 10.0, |_| {}, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_cancel_force_kills_after_grace_period() {
        let script = "trap '' TERM; while true; do sleep 0.05; done";
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = ProcessSupervisor::new(Duration::from_millis(200))
            .run(&sh(script, None), 0.0, |_| {}, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let script = format!("touch {}", marker.display());
        let err = ProcessSupervisor::default()
            .run(&sh(&script, None), 0.0, |_| {}, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Cancelled));
        assert!(!marker.exists());
    }
}
