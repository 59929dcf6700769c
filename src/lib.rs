//! ground-station telemetry host
//!
//! reads the LoRa receiver's serial output, decodes `[<id>;<values>]` packets
//! against a fixed sensor schema, logs readings to csv and pushes every
//! reading or decode failure to connected websocket viewers.
//!
//! ```text
//! serial ─► ingest ─► decoder ─┬─► sink (csv, own thread)
//!                              └─► dispatcher ─► registry ─► viewers
//! ```

pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod domain;
pub mod ingest;
pub mod registry;
pub mod schema;
pub mod server;
pub mod sink;
pub mod source;

pub use decoder::{Clock, DecodePolicy, FixedClock, PacketDecoder, SystemClock};
pub use dispatcher::{Broadcaster, PublishReport};
pub use domain::{DecodeError, DecodeErrorKind, DecodedReading, Field, TelemetryEvent};
pub use ingest::{IngestError, IngestLoop, IngestStats};
pub use registry::{Subscriber, SubscriberId, SubscriberRegistry};
pub use schema::{SchemaTable, SensorId};
pub use sink::{CsvSink, ReadingSink, SinkError, SinkHandle};
