//! External process supervision.
//!
//! [`ProcessMonitor`] runs a long-lived tool and hands its stdout lines to the
//! caller without blocking it. A single background task drains the pipe into
//! a bounded queue, so a slow consumer applies backpressure to the child
//! instead of growing memory. Short-lived tools go through [`call`].

pub mod call;

pub use call::{call, CallOutput};

use crate::utils::errors::OperationError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::ffi::{OsStr, OsString};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default number of lines buffered between the drain worker and the consumer.
pub const DEFAULT_LINE_BUFFER: usize = 1024;

/// Collect an argv into owned strings and split off the program.
pub(crate) fn split_argv<I, S>(argv: I) -> Result<(OsString, Vec<OsString>), OperationError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut argv = argv.into_iter().map(|arg| arg.as_ref().to_os_string());
    match argv.next() {
        Some(program) => Ok((program, argv.collect())),
        None => Err(OperationError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
        }),
    }
}

/// Decode one raw line, dropping the line terminator.
pub(crate) fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Watches one external process and buffers its standard output.
pub struct ProcessMonitor {
    program: String,
    pid: Option<u32>,
    lines: mpsc::Receiver<String>,
    peeked: Option<String>,
    producer_closed: bool,
    exit: watch::Receiver<Option<ExitStatus>>,
    stop: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl ProcessMonitor {
    /// Spawn `argv` with the default line buffer.
    pub fn start<I, S>(argv: I) -> Result<Self, OperationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self::with_capacity(argv, DEFAULT_LINE_BUFFER)
    }

    /// Spawn `argv`, buffering at most `capacity` unread lines.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_capacity<I, S>(argv: I, capacity: usize) -> Result<Self, OperationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (program, args) = split_argv(argv)?;
        let program_name = program.to_string_lossy().into_owned();

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| OperationError::Spawn {
                program: program_name.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| OperationError::Io {
            program: program_name.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdout was not captured"),
        })?;

        let pid = child.id();
        debug!("Started {} (pid {:?})", program_name, pid);

        let (line_tx, line_rx) = mpsc::channel(capacity.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);
        let stop = CancellationToken::new();

        let worker = tokio::spawn(drain(
            program_name.clone(),
            child,
            stdout,
            line_tx,
            exit_tx,
            stop.clone(),
        ));

        Ok(Self {
            program: program_name,
            pid,
            lines: line_rx,
            peeked: None,
            producer_closed: false,
            exit: exit_rx,
            stop,
            worker: Some(worker),
        })
    }

    /// Program name as given in argv.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id, if the child was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True if at least one unread line is buffered. Never blocks.
    pub fn has_line(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.try_receive();
        }
        self.peeked.is_some()
    }

    /// Remove and return the oldest buffered line. Never blocks.
    pub fn pop_line(&mut self) -> Option<String> {
        self.peeked.take().or_else(|| self.try_receive())
    }

    /// Wait for the next line. Returns `None` once the worker has finished
    /// and every line has been handed over.
    pub async fn next_line(&mut self) -> Option<String> {
        if let Some(line) = self.peeked.take() {
            return Some(line);
        }
        if self.producer_closed {
            return None;
        }
        let line = self.lines.recv().await;
        if line.is_none() {
            self.producer_closed = true;
        }
        line
    }

    /// True once the worker has observed the process exit.
    pub fn process_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// True once no more lines will be produced and none are left unread.
    pub fn queue_drained(&mut self) -> bool {
        !self.has_line() && self.producer_closed
    }

    /// The process has exited and all of its output has been consumed.
    pub fn has_ended(&mut self) -> bool {
        self.queue_drained() && self.process_exited()
    }

    /// Exit status recorded by the worker, if the exit has been observed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    /// Exit code, once observed. `None` when killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status().and_then(|status| status.code())
    }

    /// Wait until the worker observes the process exit.
    ///
    /// Returns `None` if the worker was stopped before the exit was seen.
    /// Lines still buffered are not consumed; with a full queue the child may
    /// be blocked writing, so drain with [`next_line`](Self::next_line) first.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        match self.exit.wait_for(|status| status.is_some()).await {
            Ok(status) => *status,
            Err(_) => None,
        }
    }

    /// Ask the child to terminate with SIGTERM.
    pub fn terminate(&self) -> std::io::Result<()> {
        if self.process_exited() {
            return Ok(());
        }
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        debug!("Sending SIGTERM to {} (pid {})", self.program, pid);
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    /// Stop the drain worker and wait for it to finish.
    ///
    /// The child process itself is left alone.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Drain worker for {} panicked: {}", self.program, e);
            }
        }
    }

    fn try_receive(&mut self) -> Option<String> {
        if self.producer_closed {
            return None;
        }
        match self.lines.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.producer_closed = true;
                None
            }
        }
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Background worker: queue stdout lines, then record the exit status. The
/// exit is recorded before the line sender is dropped, so a closed queue
/// always implies an observed exit unless the worker was stopped.
async fn drain(
    program: String,
    mut child: Child,
    stdout: ChildStdout,
    lines: mpsc::Sender<String>,
    exit: watch::Sender<Option<ExitStatus>>,
    stop: CancellationToken,
) {
    match pump_lines(&program, BufReader::new(stdout), &lines, &stop).await {
        PumpEnd::Eof => {}
        PumpEnd::ReadFailed => {
            // Reader dropped: a child still writing gets EPIPE
            debug!("Stopped reading {}, waiting for it to exit", program);
        }
        PumpEnd::Stopped | PumpEnd::ConsumerGone => return,
    }

    let status = tokio::select! {
        biased;
        _ = stop.cancelled() => return,
        status = child.wait() => status,
    };

    match status {
        Ok(status) => {
            debug!("{} exited with {}", program, status);
            exit.send_replace(Some(status));
        }
        Err(e) => warn!("Failed to wait for {}: {}", program, e),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpEnd {
    Eof,
    ReadFailed,
    Stopped,
    ConsumerGone,
}

/// Forward lines from `reader` into the queue. Takes the reader by value so
/// the pipe is closed as soon as reading ends.
async fn pump_lines<R>(
    program: &str,
    mut reader: R,
    lines: &mpsc::Sender<String>,
    stop: &CancellationToken,
) -> PumpEnd
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => return PumpEnd::Stopped,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => return PumpEnd::Eof,
            Ok(_) => {
                let line = decode_line(&buf);
                trace!("{}: {}", program, line);
                let sent = tokio::select! {
                    biased;
                    _ = stop.cancelled() => return PumpEnd::Stopped,
                    sent = lines.send(line) => sent,
                };
                if sent.is_err() {
                    return PumpEnd::ConsumerGone;
                }
            }
            Err(e) => {
                warn!("Failed to read output of {}: {}", program, e);
                return PumpEnd::ReadFailed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn collect_lines(monitor: &mut ProcessMonitor) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = monitor.next_line().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_pop_line_preserves_fifo_order() {
        let mut monitor = ProcessMonitor::start(sh("printf 'a\\nb\\nc\\n'")).unwrap();
        monitor.wait().await.unwrap();

        let mut popped = Vec::new();
        while popped.len() < 3 {
            if let Some(line) = monitor.pop_line() {
                popped.push(line);
            } else {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(popped, vec!["a", "b", "c"]);
        assert!(monitor.pop_line().is_none());
    }

    #[tokio::test]
    async fn test_has_ended_waits_for_unread_lines() {
        let mut monitor = ProcessMonitor::start(sh("printf 'a\\nb\\nc\\n'")).unwrap();
        let status = monitor.wait().await.unwrap();
        assert!(status.success());

        assert!(monitor.process_exited());
        assert!(monitor.has_line());
        assert!(!monitor.queue_drained());
        assert!(!monitor.has_ended());

        assert_eq!(collect_lines(&mut monitor).await, vec!["a", "b", "c"]);
        assert!(monitor.queue_drained());
        assert!(monitor.has_ended());
        assert_eq!(monitor.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn test_non_zero_exit_code() {
        let mut monitor = ProcessMonitor::start(sh("echo partial; exit 3")).unwrap();
        assert_eq!(collect_lines(&mut monitor).await, vec!["partial"]);
        monitor.wait().await.unwrap();
        assert_eq!(monitor.exit_code(), Some(3));
        assert!(monitor.has_ended());
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let result = ProcessMonitor::start(["/nonexistent/snapshot-agent-tool"]);
        match result {
            Err(OperationError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/snapshot-agent-tool");
            }
            _ => panic!("expected spawn error"),
        }
    }

    #[tokio::test]
    async fn test_empty_argv_is_spawn_error() {
        let argv: Vec<String> = Vec::new();
        assert!(matches!(
            ProcessMonitor::start(argv),
            Err(OperationError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_small_buffer_applies_backpressure_without_loss() {
        let mut monitor =
            ProcessMonitor::with_capacity(sh("i=0; while [ $i -lt 200 ]; do echo $i; i=$((i+1)); done"), 1)
                .unwrap();
        let lines = collect_lines(&mut monitor).await;
        let expected: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        assert_eq!(lines, expected);
        assert_eq!(monitor.wait().await.map(|s| s.success()), Some(true));
    }

    #[tokio::test]
    async fn test_lossy_decoding_and_crlf() {
        let mut monitor = ProcessMonitor::start(sh("printf 'caf\\351\\r\\nlast'")).unwrap();
        let lines = collect_lines(&mut monitor).await;
        assert_eq!(lines, vec!["caf\u{FFFD}".to_string(), "last".to_string()]);
    }

    #[tokio::test]
    async fn test_stop_does_not_kill_process() {
        let mut monitor = ProcessMonitor::start(["sleep", "30"]).unwrap();

        tokio::time::timeout(Duration::from_secs(5), monitor.stop())
            .await
            .expect("stop should join the worker promptly");
        assert!(!monitor.process_exited());
        assert!(!monitor.has_ended());

        let pid = Pid::from_raw(monitor.pid().unwrap() as i32);
        assert!(kill(pid, None).is_ok(), "child should still be alive");
        kill(pid, Signal::SIGKILL).unwrap();
    }

    #[tokio::test]
    async fn test_terminate_ends_process() {
        let mut monitor = ProcessMonitor::start(["sleep", "30"]).unwrap();
        monitor.terminate().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), monitor.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert_eq!(monitor.exit_code(), None);
    }

    /// Yields `data` once, then fails every read.
    struct FailingReader {
        data: Vec<u8>,
        _pipe: std::sync::Arc<()>,
    }

    impl tokio::io::AsyncRead for FailingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            if self.data.is_empty() {
                return std::task::Poll::Ready(Err(std::io::Error::other("read failed")));
            }
            let data = std::mem::take(&mut self.data);
            buf.put_slice(&data);
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_error_closes_the_pipe() {
        let pipe = std::sync::Arc::new(());
        let reader = BufReader::new(FailingReader {
            data: b"a\nb\n".to_vec(),
            _pipe: pipe.clone(),
        });
        let (tx, mut rx) = mpsc::channel(8);

        let end = pump_lines("fake", reader, &tx, &CancellationToken::new()).await;
        assert_eq!(end, PumpEnd::ReadFailed);
        assert_eq!(std::sync::Arc::strong_count(&pipe), 1);

        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_pump_stops_on_request() {
        let (tx, _rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        stop.cancel();
        let reader = BufReader::new(&b"a\n"[..]);
        assert_eq!(pump_lines("fake", reader, &tx, &stop).await, PumpEnd::Stopped);
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(decode_line(b"abc\n"), "abc");
        assert_eq!(decode_line(b"abc\r\n"), "abc");
        assert_eq!(decode_line(b"abc"), "abc");
        assert_eq!(decode_line(b"\n"), "");
    }
}
