//! Live-logged command output
//!
//! Reads a child process's stdout and stderr concurrently, hands every
//! completed line to a [`LineSink`] as it arrives, and keeps a copy of both
//! streams for the final [`CommandOutput`].

use super::CommandOutput;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receiver for lines of live-logged output
pub trait LineSink: Send {
    fn line(&mut self, stream: StreamKind, line: &str);
}

impl<F> LineSink for F
where
    F: FnMut(StreamKind, &str) + Send,
{
    fn line(&mut self, stream: StreamKind, line: &str) {
        self(stream, line)
    }
}

/// Sink that forwards lines to `tracing`, stdout at info and stderr at warn
#[derive(Debug, Clone)]
pub struct TracingSink {
    node: String,
}

impl TracingSink {
    pub fn new(node: impl Into<String>) -> Self {
        Self { node: node.into() }
    }
}

impl LineSink for TracingSink {
    fn line(&mut self, stream: StreamKind, line: &str) {
        match stream {
            StreamKind::Stdout => info!(node = %self.node, stream = "stdout", "{}", line),
            StreamKind::Stderr => warn!(node = %self.node, stream = "stderr", "{}", line),
        }
    }
}

/// Spawn `command`, stream its output to `sink`, and capture both streams.
///
/// The process's exit status is returned as-is; deciding whether a non-zero
/// exit is an error is left to the caller.
pub async fn run_streaming(
    command: &mut Command,
    sink: &mut dyn LineSink,
) -> io::Result<CommandOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stderr was not captured"))?;

    let mut out = LineReader::new(stdout);
    let mut err = LineReader::new(stderr);
    let mut captured_out = String::new();
    let mut captured_err = String::new();

    while !(out.done && err.done) {
        tokio::select! {
            line = out.next_line(), if !out.done => {
                if let Some(line) = line? {
                    sink.line(StreamKind::Stdout, &line);
                    captured_out.push_str(&line);
                    captured_out.push('\n');
                }
            }
            line = err.next_line(), if !err.done => {
                if let Some(line) = line? {
                    sink.line(StreamKind::Stderr, &line);
                    captured_err.push_str(&line);
                    captured_err.push('\n');
                }
            }
        }
    }

    let status = child.wait().await?;

    Ok(CommandOutput {
        exit_code: status.code(),
        stdout: captured_out,
        stderr: captured_err,
    })
}

/// Newline-delimited reader that tolerates non-UTF-8 output and yields a
/// trailing partial line once the stream closes
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
            done: false,
        }
    }

    /// Bytes of an unfinished line stay in `buf` when this future is
    /// dropped by `select!`, and the next call continues after them.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            self.done = true;
            if self.buf.is_empty() {
                return Ok(None);
            }
        }

        let mut line = std::mem::take(&mut self.buf);
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }

        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}
