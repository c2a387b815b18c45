//! Line-oriented transport to the driven system.
//!
//! Reads happen on a dedicated thread that pushes whole lines over a channel,
//! so the coordinator can wait with a deadline instead of blocking on a pipe.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::io::fifo::PipePaths;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("write to driven system failed: {0}")]
    Write(#[source] io::Error),
    #[error("read from driven system failed: {0}")]
    Read(#[source] io::Error),
    #[error("driven system closed its output")]
    Closed,
}

/// Sends outbound lines and yields raw inbound lines (terminator included).
pub trait Transport {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Next inbound line, waiting at most `timeout`. `Ok(None)` on timeout.
    fn recv_line(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Next inbound line if one is already buffered.
    fn try_recv_line(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

enum ReaderMsg {
    Line(Vec<u8>),
    Eof,
    Err(io::Error),
}

/// Transport over any reader/writer pair.
pub struct LineTransport {
    writer: Box<dyn Write + Send>,
    rx: Receiver<ReaderMsg>,
    closed: bool,
}

impl LineTransport {
    pub fn spawn<R, W>(reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("transport-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                loop {
                    let mut line = Vec::new();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => {
                            let _ = tx.send(ReaderMsg::Eof);
                            break;
                        }
                        Ok(_) => {
                            if tx.send(ReaderMsg::Line(line)).is_err() {
                                break;
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            let _ = tx.send(ReaderMsg::Err(err));
                            break;
                        }
                    }
                }
                debug!("transport reader finished");
            })?;
        Ok(Self {
            writer: Box::new(writer),
            rx,
            closed: false,
        })
    }

    /// Open the bridge's named pipes. The inbound pipe is opened first; the
    /// bridge opens them in the opposite role order so neither side deadlocks.
    pub fn open_pipes(paths: &PipePaths) -> io::Result<Self> {
        debug!(input = %paths.input.display(), "opening inbound pipe");
        let reader = File::open(&paths.input)?;
        debug!(output = %paths.output.display(), "opening outbound pipe");
        let writer = OpenOptions::new().write(true).open(&paths.output)?;
        Self::spawn(reader, writer)
    }

    fn handle(&mut self, msg: ReaderMsg) -> Result<Option<Vec<u8>>, TransportError> {
        match msg {
            ReaderMsg::Line(line) => Ok(Some(line)),
            ReaderMsg::Eof => {
                self.closed = true;
                Err(TransportError::Closed)
            }
            ReaderMsg::Err(err) => {
                self.closed = true;
                warn!(err = %err, "transport read failed");
                Err(TransportError::Read(err))
            }
        }
    }
}

impl Transport for LineTransport {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        trace!(line, "send");
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush())
            .map_err(TransportError::Write)
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => self.handle(msg),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                Err(TransportError::Closed)
            }
        }
    }

    fn try_recv_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.rx.try_recv() {
            Ok(msg) => self.handle(msg),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                Err(TransportError::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::io::bridge::SharedWriter;

    #[test]
    fn yields_lines_then_closed() {
        let input = Cursor::new(b"one\ntwo\r\nlast".to_vec());
        let mut transport = LineTransport::spawn(input, io::sink()).expect("spawn");
        let timeout = Duration::from_secs(1);
        assert_eq!(
            transport.recv_line(timeout).expect("line"),
            Some(b"one\n".to_vec())
        );
        assert_eq!(
            transport.recv_line(timeout).expect("line"),
            Some(b"two\r\n".to_vec())
        );
        assert_eq!(
            transport.recv_line(timeout).expect("line"),
            Some(b"last".to_vec())
        );
        assert!(matches!(
            transport.recv_line(timeout),
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.try_recv_line(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn send_appends_terminator() {
        let out = SharedWriter::new(Vec::new());
        let mut transport =
            LineTransport::spawn(io::empty(), out.clone()).expect("spawn");
        transport.send_line("state").expect("send");
        transport.send_line("start IRONCLAD 0").expect("send");
        assert_eq!(out.snapshot(), b"state\nstart IRONCLAD 0\n".to_vec());
    }
}
