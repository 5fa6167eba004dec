//! facewatch
//!
//! Multi-camera face recognition pipeline. Each camera runs on its own capture
//! thread, samples every other frame, normalizes oversized frames and appends them
//! to one shared buffer. A single dispatcher drains the buffer in batches and runs
//! recognition against a set of known faces. Results accumulate in memory until
//! shutdown, when they are written to a report and mailed once.
//!
//! # Module Structure
//!
//! - `frame`: decoded frames, resize policy, the shared `FrameBuffer`
//! - `ingest`: camera sources (HTTP/MJPEG, RTSP, synthetic `stub://`)
//! - `producer`: per-camera capture loops and the roster that tracks them
//! - `recognize`: face backends, the known-face set, the tolerance rule
//! - `dispatch`: batch consumer of the frame buffer
//! - `results`: recognition results and the CSV/SQLite stores
//! - `report`: summary email and SMTP delivery
//! - `shutdown`: stop signal and the ordered shutdown sequence
//! - `pipeline`: wiring of all of the above
//! - `config`, `logging`: process setup

pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod producer;
pub mod recognize;
pub mod report;
pub mod results;
pub mod shutdown;

pub use config::FacewatchConfig;
pub use dispatch::{BatchDispatcher, DispatchSettings};
pub use error::PipelineError;
pub use frame::{
    BufferCapacity, BufferStats, Frame, FrameBuffer, FrameEntry, OverflowPolicy, ResizePolicy,
};
pub use ingest::{CameraSource, ReleaseHandle, SourceOptions, SourceState};
pub use logging::init_logging;
pub use pipeline::Pipeline;
pub use producer::{CameraSpec, ExitReason, ProducerContext, ProducerExit, ProducerRoster};
pub use recognize::{
    BoundingBox, DetectedFace, FaceBackend, FaceRecognizer, KnownFaceSet, RecognizedFace,
    Recognizer, UNKNOWN_LABEL,
};
pub use report::{EmailMessage, Mailer, SmtpConfig, SmtpMailer, SmtpSecurity};
pub use results::{
    CsvResultStore, RecognitionResult, ResultAccumulator, ResultStore, SqliteResultStore,
};
pub use shutdown::{
    ReportDelivery, ShutdownCoordinator, ShutdownReport, ShutdownSettings, ShutdownSignal,
};
