//! ==============================================================================
//! source.rs - raw line sources
//! ==============================================================================
//!
//! ```text
//! purpose:
//!     turns the ground-station serial port (or stdin, for replaying captured
//!     logs) into a stream of text lines for the ingest loop.
//!
//! why a dedicated thread?:
//!     serialport is a blocking api. the reader thread loops on read_until with
//!     a short timeout, and pushes complete lines into a bounded tokio channel.
//!     timeouts only mean "nothing on the wire yet"; they are also when the
//!     thread notices that nobody is listening anymore and exits.
//!
//! relationships:
//!     - used by: main.rs (picks serial or stdin), ingest.rs (consumes stream)
//! ```
//!
//! ==============================================================================

use futures::stream::{self, BoxStream, StreamExt};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::{self, BufRead, BufReader, Read};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio::sync::mpsc;

pub type LineStream = BoxStream<'static, io::Result<String>>;

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const LINE_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Open `path` at `baud_rate` (8N1, no flow control) and stream its lines.
pub fn serial_lines(path: &str, baud_rate: u32) -> Result<LineStream, SourceError> {
    let port = serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_TIMEOUT)
        .open()?;

    tracing::info!(port = path, baud_rate, "opened serial port");
    blocking_lines(port).map_err(SourceError::from)
}

/// stream lines from any blocking reader on a dedicated thread
pub fn blocking_lines<R: Read + Send + 'static>(reader: R) -> io::Result<LineStream> {
    let (tx, mut rx) = mpsc::channel(LINE_BUFFER);
    std::thread::Builder::new()
        .name("serial-reader".to_string())
        .spawn(move || pump_lines(reader, tx))?;
    Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
}

pub fn stdin_lines() -> LineStream {
    async_lines(tokio::io::stdin())
}

pub fn async_lines<R: AsyncRead + Unpin + Send + 'static>(reader: R) -> LineStream {
    let lines = tokio::io::BufReader::new(reader).lines();
    stream::unfold(Some(lines), |state| async move {
        let Some(mut lines) = state else {
            return None;
        };
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(lines))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// log the serial ports the OS knows about
pub fn log_available_ports() {
    match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => tracing::warn!("no serial ports found"),
        Ok(ports) => {
            for p in ports {
                tracing::info!(port = %p.port_name, kind = ?p.port_type, "available serial port");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to enumerate serial ports"),
    }
}

fn pump_lines<R: Read>(reader: R, tx: mpsc::Sender<io::Result<String>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                if !buf.is_empty() {
                    let _ = tx.blocking_send(Ok(take_line(&mut buf)));
                }
                tracing::info!("line source reached end of input");
                break;
            }
            Ok(_) if buf.ends_with(b"\n") => {
                if tx.blocking_send(Ok(take_line(&mut buf))).is_err() {
                    break;
                }
            }
            // partial line before eof; the next read returns 0
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::error!(error = %e, "line source read failed");
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
    tracing::debug!("line reader thread stopped");
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    buf.clear();
    line
}
