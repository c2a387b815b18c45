//! Directional line bridges between the driven process's stdio and the
//! named pipes the harness talks through.
//!
//! Each bridge owns one worker thread. The worker reports that it has started
//! before it opens its endpoints (opening a FIFO blocks until the peer shows
//! up), and `start_*` only returns once that report has arrived. Callers emit
//! the `ready` handshake after both bridges have started.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

/// How long `start_*` waits for the worker thread to come up.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How a bridge worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeExit {
    /// Source reached end of file; everything read was forwarded.
    Eof { lines: u64 },
    /// An open, read, write or flush failed. Only this bridge stops.
    Failed { lines: u64, error: String },
}

impl BridgeExit {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for BridgeExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof { lines } => write!(f, "eof after {lines} lines"),
            Self::Failed { lines, error } => write!(f, "failed after {lines} lines: {error}"),
        }
    }
}

/// Owner-side view of a running bridge. Dropping it detaches the worker.
#[derive(Debug)]
pub struct BridgeHandle {
    name: &'static str,
    rx: Receiver<BridgeExit>,
    exit: Option<BridgeExit>,
}

impl BridgeHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Non-blocking check for worker exit. Once observed, the exit is sticky.
    pub fn try_exit(&mut self) -> Option<&BridgeExit> {
        if self.exit.is_none() {
            match self.rx.try_recv() {
                Ok(exit) => self.exit = Some(exit),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.exit = Some(BridgeExit::Failed {
                        lines: 0,
                        error: "bridge worker vanished".to_string(),
                    });
                }
            }
        }
        self.exit.as_ref()
    }

    /// Wait up to `timeout` for the worker to exit.
    pub fn wait(&mut self, timeout: Duration) -> Option<&BridgeExit> {
        if self.exit.is_none() {
            match self.rx.recv_timeout(timeout) {
                Ok(exit) => self.exit = Some(exit),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.exit = Some(BridgeExit::Failed {
                        lines: 0,
                        error: "bridge worker vanished".to_string(),
                    });
                }
            }
        }
        self.exit.as_ref()
    }
}

/// Copy the driven process's input (`open_source`) into the harness-facing pipe.
pub fn start_input_bridge<R, W, OR, OW>(open_source: OR, open_sink: OW) -> io::Result<BridgeHandle>
where
    R: Read + 'static,
    W: Write + 'static,
    OR: FnOnce() -> io::Result<R> + Send + 'static,
    OW: FnOnce() -> io::Result<W> + Send + 'static,
{
    start_bridge("input-bridge", open_source, open_sink)
}

/// Copy the harness-facing pipe back to the driven process's real stdout.
pub fn start_output_bridge<R, W, OR, OW>(
    open_source: OR,
    open_sink: OW,
) -> io::Result<BridgeHandle>
where
    R: Read + 'static,
    W: Write + 'static,
    OR: FnOnce() -> io::Result<R> + Send + 'static,
    OW: FnOnce() -> io::Result<W> + Send + 'static,
{
    start_bridge("output-bridge", open_source, open_sink)
}

fn start_bridge<R, W, OR, OW>(
    name: &'static str,
    open_source: OR,
    open_sink: OW,
) -> io::Result<BridgeHandle>
where
    R: Read + 'static,
    W: Write + 'static,
    OR: FnOnce() -> io::Result<R> + Send + 'static,
    OW: FnOnce() -> io::Result<W> + Send + 'static,
{
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (exit_tx, exit_rx) = mpsc::channel();

    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = started_tx.send(());
            let exit = run_bridge(name, open_source, open_sink);
            match &exit {
                BridgeExit::Eof { lines } => info!(bridge = name, lines, "bridge reached eof"),
                BridgeExit::Failed { lines, error } => {
                    warn!(bridge = name, lines, error = %error, "bridge failed");
                }
            }
            let _ = exit_tx.send(exit);
        })?;

    match started_rx.recv_timeout(STARTUP_TIMEOUT) {
        Ok(()) => {
            debug!(bridge = name, "bridge started");
            Ok(BridgeHandle {
                name,
                rx: exit_rx,
                exit: None,
            })
        }
        Err(_) => Err(io::Error::other(format!("{name} did not start"))),
    }
}

fn run_bridge<R, W, OR, OW>(name: &'static str, open_source: OR, open_sink: OW) -> BridgeExit
where
    R: Read,
    W: Write,
    OR: FnOnce() -> io::Result<R>,
    OW: FnOnce() -> io::Result<W>,
{
    let source = match open_source() {
        Ok(source) => source,
        Err(err) => {
            return BridgeExit::Failed {
                lines: 0,
                error: format!("open source: {err}"),
            };
        }
    };
    let mut sink = match open_sink() {
        Ok(sink) => sink,
        Err(err) => {
            return BridgeExit::Failed {
                lines: 0,
                error: format!("open sink: {err}"),
            };
        }
    };
    debug!(bridge = name, "bridge endpoints open");

    let mut lines = 0u64;
    match copy_lines(BufReader::new(source), &mut sink, &mut lines) {
        Ok(()) => BridgeExit::Eof { lines },
        Err(err) => BridgeExit::Failed {
            lines,
            error: err.to_string(),
        },
    }
}

/// Copy whole lines from `source` to `sink`, flushing after each one. A final
/// unterminated line is forwarded as-is. `lines` counts forwarded lines even
/// when the copy fails part way.
pub fn copy_lines<R: BufRead, W: Write>(
    mut source: R,
    sink: &mut W,
    lines: &mut u64,
) -> io::Result<()> {
    let mut line = Vec::new();
    loop {
        line.clear();
        match source.read_until(b'\n', &mut line) {
            Ok(0) => return Ok(()),
            Ok(_) => {
                sink.write_all(&line)?;
                sink.flush()?;
                *lines += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

/// Writer shared between threads. Each `write` call holds the lock, so a
/// whole line written with one `write_all` is never interleaved.
#[derive(Debug, Default)]
pub struct SharedWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for SharedWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Write> SharedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Write one line and flush it under a single lock.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut inner = self.lock()?;
        inner.write_all(line.as_bytes())?;
        inner.write_all(b"\n")?;
        inner.flush()
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, W>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("shared writer lock poisoned"))
    }
}

impl<W: Clone> SharedWriter<W> {
    /// Copy of the current contents (test sinks).
    pub fn snapshot(&self) -> W {
        match self.inner.lock() {
            Ok(inner) => inner.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl<W: Write> Write for SharedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.lock()?.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn copies_lines_until_eof() {
        let sink = SharedWriter::new(Vec::new());
        let out = sink.clone();
        let mut handle = start_input_bridge(
            || Ok(Cursor::new(b"{\"a\":1}\nstate\ntail".to_vec())),
            move || Ok(out),
        )
        .expect("start");

        let exit = handle.wait(Duration::from_secs(5)).cloned();
        assert_eq!(exit, Some(BridgeExit::Eof { lines: 3 }));
        assert_eq!(sink.snapshot(), b"{\"a\":1}\nstate\ntail".to_vec());
        assert_eq!(handle.name(), "input-bridge");
    }

    #[test]
    fn write_failure_stops_only_this_bridge() {
        let mut failing = start_output_bridge(
            || Ok(Cursor::new(b"line\n".to_vec())),
            || Ok(FailingWriter),
        )
        .expect("start");
        let sink = SharedWriter::new(Vec::new());
        let out = sink.clone();
        let mut healthy =
            start_input_bridge(|| Ok(Cursor::new(b"ok\n".to_vec())), move || Ok(out))
                .expect("start");

        let exit = failing.wait(Duration::from_secs(5)).cloned().expect("exit");
        assert!(exit.is_failure(), "{exit}");
        assert_eq!(
            healthy.wait(Duration::from_secs(5)).cloned(),
            Some(BridgeExit::Eof { lines: 1 })
        );
        assert_eq!(sink.snapshot(), b"ok\n".to_vec());
    }

    #[test]
    fn open_failure_is_reported_through_the_handle() {
        let mut handle = start_input_bridge(
            || -> io::Result<Cursor<Vec<u8>>> { Err(io::Error::other("no such pipe")) },
            || Ok(io::sink()),
        )
        .expect("start");
        match handle.wait(Duration::from_secs(5)) {
            Some(BridgeExit::Failed { lines, error }) => {
                assert_eq!(*lines, 0);
                assert!(error.contains("no such pipe"), "{error}");
            }
            other => panic!("unexpected exit: {other:?}"),
        }
        assert!(handle.try_exit().is_some());
    }

    #[test]
    fn shared_writer_lines_are_whole() {
        let sink = SharedWriter::new(Vec::new());
        let workers: Vec<_> = (0..4)
            .map(|n| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        sink.write_line(&format!("worker-{n}")).expect("write");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("join");
        }
        let text = String::from_utf8(sink.snapshot()).expect("utf8");
        assert_eq!(text.lines().count(), 200);
        assert!(text.lines().all(|line| line.starts_with("worker-") && line.len() == 8));
    }
}
