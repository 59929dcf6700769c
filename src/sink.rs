//! ==============================================================================
//! sink.rs - durable reading log
//! ==============================================================================
//!
//! ```text
//! purpose:
//!     appends every decoded reading to csv so a flight can be analysed after
//!     the fact. decode errors are never written here.
//!
//! layout:
//!     one file per sensor id, because each sensor has its own columns:
//!
//!         <dir>/sensor_data_20240501120000_sensor2.csv
//!         timestamp,Pressure,Temperature,Altitude
//!         2024-05-01T12:00:00.123Z,1013.25,23.5,100
//!
//!     fields a short packet did not carry are left as empty cells.
//!
//! threading:
//!     file writes are blocking, so the sink lives on a spawn_blocking worker
//!     behind a bounded channel (SinkHandle). the ingest loop only ever does a
//!     try_send: a slow or broken disk drops readings from the log, it never
//!     delays the broadcast to viewers.
//! ```
//!
//! ==============================================================================

use crate::domain::DecodedReading;
use crate::schema::{SchemaTable, SensorId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("no schema for sensor {0}")]
    UnknownSensor(SensorId),
}

/// append-only store for decoded readings
pub trait ReadingSink: Send + 'static {
    fn append(&mut self, reading: &DecodedReading) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
}

// ==============================================================================
// csv sink
// ==============================================================================

pub struct CsvSink {
    directory: PathBuf,
    file_prefix: String,
    stamp: String,
    schema: SchemaTable,
    writers: HashMap<SensorId, csv::Writer<File>>,
}

impl CsvSink {
    /// `started` fixes the file name stamp for the whole session
    pub fn new(
        directory: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
        schema: SchemaTable,
        started: DateTime<Utc>,
    ) -> Result<Self, SinkError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            file_prefix: file_prefix.into(),
            stamp: started.format("%Y%m%d%H%M%S").to_string(),
            schema,
            writers: HashMap::new(),
        })
    }

    pub fn path_for(&self, sensor_id: SensorId) -> PathBuf {
        self.directory.join(format!(
            "{}_{}_sensor{}.csv",
            self.file_prefix, self.stamp, sensor_id
        ))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn writer(&mut self, sensor_id: SensorId) -> Result<&mut csv::Writer<File>, SinkError> {
        if !self.writers.contains_key(&sensor_id) {
            let names = self
                .schema
                .fields(sensor_id)
                .ok_or(SinkError::UnknownSensor(sensor_id))?;
            let path = self.path_for(sensor_id);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let is_new = file.metadata()?.len() == 0;

            let mut writer = csv::Writer::from_writer(file);
            if is_new {
                let mut header = vec!["timestamp"];
                header.extend_from_slice(names);
                writer.write_record(&header)?;
            }
            tracing::info!(path = %path.display(), "opened reading log");
            self.writers.insert(sensor_id, writer);
        }
        self.writers
            .get_mut(&sensor_id)
            .ok_or(SinkError::UnknownSensor(sensor_id))
    }
}

impl ReadingSink for CsvSink {
    fn append(&mut self, reading: &DecodedReading) -> Result<(), SinkError> {
        let names = self
            .schema
            .fields(reading.sensor_id)
            .ok_or(SinkError::UnknownSensor(reading.sensor_id))?;

        let mut record = Vec::with_capacity(names.len() + 1);
        record.push(reading.timestamp_string());
        for name in names {
            record.push(reading.get(name).map(|v| v.to_string()).unwrap_or_default());
        }

        self.writer(reading.sensor_id)?.write_record(&record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

// ==============================================================================
// buffered hand-off
// ==============================================================================

pub const DEFAULT_SINK_BUFFER: usize = 1024;

/// how long close() waits for the worker to drain
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// non-blocking front of a sink running on a blocking worker thread
pub struct SinkHandle {
    tx: mpsc::Sender<DecodedReading>,
    worker: JoinHandle<()>,
    close_timeout: Duration,
}

impl SinkHandle {
    pub fn spawn<S: ReadingSink>(mut sink: S, buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<DecodedReading>(buffer.max(1));

        let worker = tokio::task::spawn_blocking(move || {
            // flush whenever the backlog is drained
            while let Some(reading) = rx.blocking_recv() {
                persist(&mut sink, &reading);
                while let Ok(next) = rx.try_recv() {
                    persist(&mut sink, &next);
                }
                if let Err(e) = sink.flush() {
                    tracing::error!(error = %e, "failed to flush reading log");
                }
            }
            if let Err(e) = sink.flush() {
                tracing::error!(error = %e, "failed to flush reading log on close");
            }
            tracing::debug!("sink worker stopped");
        });

        Self {
            tx,
            worker,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_close_timeout(mut self, limit: Duration) -> Self {
        self.close_timeout = limit;
        self
    }

    /// Hand a reading to the worker. Returns `false` if it was dropped.
    pub fn append(&self, reading: DecodedReading) -> bool {
        match self.tx.try_send(reading) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(r)) => {
                tracing::warn!(sensor = r.sensor_id, "reading log backlog full, dropping reading");
                false
            }
            Err(mpsc::error::TrySendError::Closed(r)) => {
                tracing::error!(sensor = r.sensor_id, "reading log worker gone, dropping reading");
                false
            }
        }
    }

    /// Drain everything queued, flush, and stop the worker.
    ///
    /// Gives up after the close timeout and returns `false`; a stuck worker
    /// is left to finish on its own.
    pub async fn close(self) -> bool {
        let Self {
            tx,
            worker,
            close_timeout,
        } = self;
        drop(tx);
        match tokio::time::timeout(close_timeout, worker).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "sink worker panicked");
                false
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = close_timeout.as_millis() as u64,
                    "reading log did not drain in time, abandoning it"
                );
                false
            }
        }
    }
}

fn persist<S: ReadingSink>(sink: &mut S, reading: &DecodedReading) {
    if let Err(e) = sink.append(reading) {
        tracing::error!(error = %e, sensor = reading.sensor_id, "failed to persist reading");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Field;
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn reading(sensor_id: SensorId, fields: Vec<Field>) -> DecodedReading {
        DecodedReading { sensor_id, fields, timestamp: ts() }
    }

    #[test]
    fn test_csv_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path(), "sensor_data", SchemaTable::default(), ts()).unwrap();

        sink.append(&reading(
            2,
            vec![
                Field { name: "Pressure", value: 1013.25 },
                Field { name: "Temperature", value: 23.5 },
            ],
        ))
        .unwrap();
        sink.append(&reading(6, vec![Field { name: "Temperature", value: f64::NAN }]))
            .unwrap();
        sink.flush().unwrap();

        let pressure = std::fs::read_to_string(sink.path_for(2)).unwrap();
        assert_eq!(
            pressure,
            "timestamp,Pressure,Temperature,Altitude\n2024-05-01T12:00:00.000Z,1013.25,23.5,\n"
        );
        assert!(sink
            .path_for(2)
            .ends_with("sensor_data_20240501120000_sensor2.csv"));

        let humidity = std::fs::read_to_string(sink.path_for(6)).unwrap();
        assert_eq!(
            humidity,
            "timestamp,Temperature,Humidity\n2024-05-01T12:00:00.000Z,NaN,\n"
        );
    }

    #[test]
    fn test_csv_sink_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let r = reading(6, vec![Field { name: "Temperature", value: 1.0 }]);
        for _ in 0..2 {
            let mut sink = CsvSink::new(dir.path(), "log", SchemaTable::default(), ts()).unwrap();
            sink.append(&r).unwrap();
            sink.flush().unwrap();
        }
        let sink = CsvSink::new(dir.path(), "log", SchemaTable::default(), ts()).unwrap();
        let content = std::fs::read_to_string(sink.path_for(6)).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert_eq!(content.matches("timestamp").count(), 1);
    }

    #[test]
    fn test_csv_sink_rejects_unknown_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path(), "log", SchemaTable::default(), ts()).unwrap();
        let err = sink.append(&reading(99, vec![])).unwrap_err();
        assert!(matches!(err, SinkError::UnknownSensor(99)));
    }

    #[derive(Clone, Default)]
    struct Recording {
        readings: Arc<Mutex<Vec<DecodedReading>>>,
        flushes: Arc<Mutex<usize>>,
    }

    impl ReadingSink for Recording {
        fn append(&mut self, reading: &DecodedReading) -> Result<(), SinkError> {
            self.readings.lock().unwrap().push(reading.clone());
            Ok(())
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            *self.flushes.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handle_drains_on_close() {
        let recording = Recording::default();
        let handle = SinkHandle::spawn(recording.clone(), 16);
        for id in 1..=5 {
            assert!(handle.append(reading(id, vec![])));
        }
        assert!(handle.close().await);

        let ids: Vec<_> = recording.readings.lock().unwrap().iter().map(|r| r.sensor_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(*recording.flushes.lock().unwrap() >= 1);
    }

    struct Failing;

    impl ReadingSink for Failing {
        fn append(&mut self, _reading: &DecodedReading) -> Result<(), SinkError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into())
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into())
        }
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_propagate() {
        let handle = SinkHandle::spawn(Failing, 4);
        assert!(handle.append(reading(2, vec![])));
        handle.close().await;
    }

    /// holds every append until the gate is opened (sender dropped)
    struct Gated {
        gate: std::sync::mpsc::Receiver<()>,
        entered: std::sync::mpsc::Sender<SensorId>,
        readings: Arc<Mutex<Vec<SensorId>>>,
    }

    impl ReadingSink for Gated {
        fn append(&mut self, reading: &DecodedReading) -> Result<(), SinkError> {
            let _ = self.entered.send(reading.sensor_id);
            let _ = self.gate.recv();
            self.readings.lock().unwrap().push(reading.sensor_id);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    fn gated() -> (
        Gated,
        std::sync::mpsc::Sender<()>,
        std::sync::mpsc::Receiver<SensorId>,
        Arc<Mutex<Vec<SensorId>>>,
    ) {
        let (open, gate) = std::sync::mpsc::channel();
        let (entered, entries) = std::sync::mpsc::channel();
        let readings = Arc::new(Mutex::new(Vec::new()));
        let sink = Gated {
            gate,
            entered,
            readings: readings.clone(),
        };
        (sink, open, entries, readings)
    }

    #[tokio::test]
    async fn test_full_buffer_drops_reading() {
        let (sink, open, entries, readings) = gated();
        let handle = SinkHandle::spawn(sink, 1);

        assert!(handle.append(reading(1, vec![])));
        // the worker holds reading 1, the buffer has room for one more
        let first = tokio::task::spawn_blocking(move || entries.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert!(handle.append(reading(2, vec![])));
        assert!(!handle.append(reading(3, vec![])));

        drop(open);
        assert!(handle.close().await);
        assert_eq!(*readings.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_close_gives_up_on_stuck_worker() {
        let (sink, open, _entries, _readings) = gated();
        let handle = SinkHandle::spawn(sink, 4).with_close_timeout(Duration::from_millis(50));
        assert!(handle.append(reading(2, vec![])));

        let closed = tokio::time::timeout(Duration::from_secs(2), handle.close())
            .await
            .expect("close must not hang on a stuck sink");
        assert!(!closed);
        // let the worker thread finish so the runtime can shut down
        drop(open);
    }
}
