use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use facewatch::config::FacewatchConfig;
use facewatch::recognize::{KnownFace, UNKNOWN_LABEL};
use facewatch::report::{REPORT_BODY, REPORT_SUBJECT};
use facewatch::{
    BatchDispatcher, BoundingBox, CameraSpec, CsvResultStore, DetectedFace, DispatchSettings,
    EmailMessage, FaceBackend, Frame, FrameBuffer, KnownFaceSet, Mailer, Pipeline, PipelineError,
    ProducerContext, ProducerRoster, RecognitionResult, Recognizer, ReportDelivery, ResizePolicy,
    ResultStore, ShutdownCoordinator, ShutdownReport, ShutdownSettings, ShutdownSignal,
    SourceOptions,
};

/// One face per frame. 8px-wide frames show alice, anything else a stranger.
struct ScriptedBackend;

impl FaceBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect_faces(&mut self, frame: &Frame, _upsample: u32) -> Result<Vec<DetectedFace>> {
        let encoding = if frame.width == 8 {
            vec![0.1, 0.0]
        } else {
            vec![5.0, 5.0]
        };
        Ok(vec![DetectedFace {
            location: BoundingBox::new(0, frame.width, frame.height, 0),
            encoding,
        }])
    }
}

#[derive(Clone, Default)]
struct RecordingStore {
    flushes: Arc<Mutex<Vec<Vec<RecognitionResult>>>>,
    path: PathBuf,
}

impl ResultStore for RecordingStore {
    fn flush(&mut self, results: &[RecognitionResult]) -> Result<PathBuf, PipelineError> {
        self.flushes.lock().unwrap().push(results.to_vec());
        Ok(self.path.clone())
    }
}

#[derive(Clone, Default)]
struct RecordingMailer {
    sent: Arc<Mutex<Vec<EmailMessage>>>,
}

impl Mailer for RecordingMailer {
    fn send(&mut self, message: &EmailMessage) -> Result<(), PipelineError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FailingStore {
    attempts: Arc<Mutex<usize>>,
}

impl ResultStore for FailingStore {
    fn flush(&mut self, _results: &[RecognitionResult]) -> Result<PathBuf, PipelineError> {
        *self.attempts.lock().unwrap() += 1;
        Err(PipelineError::WriteFailed("disk full".to_string()))
    }
}

#[derive(Clone, Default)]
struct FailingMailer {
    attempts: Arc<Mutex<usize>>,
}

impl Mailer for FailingMailer {
    fn send(&mut self, _message: &EmailMessage) -> Result<(), PipelineError> {
        *self.attempts.lock().unwrap() += 1;
        Err(PipelineError::SendFailed("connection refused".to_string()))
    }
}

fn known_faces() -> KnownFaceSet {
    KnownFaceSet::new(vec![KnownFace {
        name: "alice".to_string(),
        encoding: vec![0.0, 0.0],
    }])
    .unwrap()
}

fn delivery(mailer: &RecordingMailer) -> ReportDelivery {
    ReportDelivery {
        mailer: Box::new(mailer.clone()),
        sender: "cams@example.com".to_string(),
        receiver: "ops@example.com".to_string(),
    }
}

fn producer_context(buffer: &Arc<FrameBuffer>, signal: &ShutdownSignal) -> ProducerContext {
    ProducerContext {
        buffer: buffer.clone(),
        signal: signal.clone(),
        resize: ResizePolicy::default(),
        source_options: SourceOptions::default(),
    }
}

/// cam1 and cam2 run until their streams end; nothing has been dispatched yet.
/// Leaves 7 frames in the buffer (2 from cam1, 5 from cam2).
fn ended_cameras() -> Result<(Arc<FrameBuffer>, ShutdownSignal, ProducerRoster)> {
    let buffer = Arc::new(FrameBuffer::unbounded());
    let signal = ShutdownSignal::new();
    let mut roster = ProducerRoster::new(producer_context(&buffer, &signal));
    roster.spawn(CameraSpec::new("cam1", "stub://cam1?frames=4&width=8&height=8"))?;
    roster.spawn(CameraSpec::new("cam2", "stub://cam2?frames=10&width=16&height=8"))?;
    assert_eq!(roster.wait_for_exit(Duration::from_secs(10)), 0);
    assert_eq!(buffer.len(), 7);
    Ok((buffer, signal, roster))
}

fn dispatcher(buffer: &Arc<FrameBuffer>) -> BatchDispatcher<Recognizer<ScriptedBackend>> {
    BatchDispatcher::new(
        buffer.clone(),
        Recognizer::new(ScriptedBackend),
        Arc::new(known_faces()),
        DispatchSettings::default(),
    )
}

fn shutdown_with(
    buffer: &Arc<FrameBuffer>,
    signal: &ShutdownSignal,
    roster: ProducerRoster,
    store: Box<dyn ResultStore>,
    delivery: Option<ReportDelivery>,
    settings: ShutdownSettings,
) -> ShutdownReport {
    ShutdownCoordinator::new(signal.clone(), buffer.clone(), store, delivery, settings)
        .shutdown(roster, dispatcher(buffer))
}

fn config_file(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn two_failing_cameras_are_fully_recognized_and_reported_once() -> Result<()> {
    let buffer = Arc::new(FrameBuffer::unbounded());
    let signal = ShutdownSignal::new();
    let mut roster = ProducerRoster::new(ProducerContext {
        buffer: buffer.clone(),
        signal: signal.clone(),
        resize: ResizePolicy::default(),
        source_options: SourceOptions::default(),
    });
    roster.spawn(CameraSpec::new("cam1", "stub://cam1?frames=4&width=8&height=8"))?;
    roster.spawn(CameraSpec::new("cam2", "stub://cam2?frames=10&width=16&height=8"))?;
    assert_eq!(roster.wait_for_exit(Duration::from_secs(10)), 0);

    // 3 reads after validation on cam1 -> 2 buffered; 9 on cam2 -> 5 buffered.
    let buffered: Vec<(String, u64)> = roster
        .exits()
        .iter()
        .map(|exit| (exit.camera.clone(), exit.buffered))
        .collect();
    assert!(buffered.contains(&("cam1".to_string(), 2)));
    assert!(buffered.contains(&("cam2".to_string(), 5)));
    assert_eq!(buffer.len(), 7);

    let mut dispatcher = BatchDispatcher::new(
        buffer.clone(),
        Recognizer::new(ScriptedBackend),
        Arc::new(known_faces()),
        DispatchSettings::default(),
    );
    assert_eq!(dispatcher.dispatch_once(), 7);
    assert_eq!(dispatcher.dispatch_once(), 0);
    assert!(dispatcher.batches() <= 2);
    assert_eq!(dispatcher.results().len(), 7);

    let dir = tempfile::tempdir()?;
    let store = RecordingStore {
        path: dir.path().join("inferred_faces.csv"),
        ..RecordingStore::default()
    };
    let mailer = RecordingMailer::default();
    let report = ShutdownCoordinator::new(
        signal.clone(),
        buffer.clone(),
        Box::new(store.clone()),
        Some(delivery(&mailer)),
        ShutdownSettings::default(),
    )
    .shutdown(roster, dispatcher);

    assert!(signal.is_raised());
    assert!(report.stragglers.is_empty());
    assert_eq!(report.frames_drained, 0);
    assert_eq!(report.results_flushed, 7);
    assert!(report.report_sent);
    assert_eq!(report.buffer.appended, 7);
    assert_eq!(report.buffer.drained, 7);

    let flushes = store.flushes.lock().unwrap();
    assert_eq!(flushes.len(), 1);
    let results = &flushes[0];
    assert_eq!(results.len(), 7);
    let unique: HashSet<(String, u64)> = results
        .iter()
        .map(|r| (r.camera.clone(), r.frame_sequence))
        .collect();
    assert_eq!(unique.len(), 7);
    for result in results.iter() {
        if result.camera == "cam1" {
            assert_eq!(result.label, "alice");
            assert!(result.distance.is_some());
        } else {
            assert_eq!(result.label, UNKNOWN_LABEL);
        }
    }

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, REPORT_SUBJECT);
    assert_eq!(sent[0].body, REPORT_BODY);
    assert_eq!(sent[0].attachment, Some(store.path.clone()));
    Ok(())
}

#[test]
fn pipeline_run_stops_when_every_camera_has_ended() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config_file(
        r#"{
            "cameras": {
                "cam1": "stub://cam1?frames=4&width=8&height=8",
                "cam2": "stub://cam2?frames=10&width=16&height=8",
                "dead": "stub://dead?frames=0"
            }
        }"#,
    );
    let config = FacewatchConfig::load_from(Some(config.path()))?;
    let csv_path = dir.path().join("reports").join("inferred_faces.csv");
    let mailer = RecordingMailer::default();

    let report = Pipeline::new(config, known_faces()).run(
        Recognizer::new(ScriptedBackend),
        Box::new(CsvResultStore::new(&csv_path)),
        Some(delivery(&mailer)),
    );

    assert_eq!(report.results_flushed, 7);
    assert_eq!(report.artifact.as_deref(), Some(csv_path.as_path()));
    assert_eq!(report.buffer.appended, 7);
    assert_eq!(report.buffer.drained, 7);
    assert!(report.report_sent);
    assert_eq!(mailer.sent.lock().unwrap().len(), 1);

    let csv = std::fs::read_to_string(&csv_path)?;
    // Header plus one row per face.
    assert_eq!(csv.lines().count(), 8);
    assert_eq!(csv.lines().filter(|l| l.contains(",alice,")).count(), 2);
    Ok(())
}

#[test]
fn stop_signal_shuts_down_live_cameras() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config_file(
        r#"{
            "cameras": { "lobby": "stub://lobby?width=8&height=8&interval_ms=2" },
            "shutdown": { "join_timeout_ms": 2000 }
        }"#,
    );
    let config = FacewatchConfig::load_from(Some(config.path()))?;
    let pipeline = Pipeline::new(config, known_faces());
    let signal = pipeline.signal();
    let buffer = pipeline.buffer();
    let store = RecordingStore {
        path: dir.path().join("faces.csv"),
        ..RecordingStore::default()
    };

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        signal.raise();
        buffer.notify_all();
    });
    let report = pipeline.run(Recognizer::new(ScriptedBackend), Box::new(store.clone()), None);
    stopper.join().unwrap();

    assert!(report.stragglers.is_empty());
    assert!(!report.report_sent);
    assert_eq!(report.buffer.dropped, 0);
    assert_eq!(report.buffer.pending, 0);
    assert_eq!(report.buffer.appended, report.buffer.drained);
    assert!(report.buffer.appended > 0);
    let flushes = store.flushes.lock().unwrap();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].len() as u64, report.buffer.drained);
    assert!(flushes[0].iter().all(|r| r.label == "alice"));
    Ok(())
}

#[test]
fn buffered_frames_are_dispatched_during_shutdown() -> Result<()> {
    let (buffer, signal, roster) = ended_cameras()?;
    let store = RecordingStore {
        path: PathBuf::from("faces.csv"),
        ..RecordingStore::default()
    };

    let report = shutdown_with(
        &buffer,
        &signal,
        roster,
        Box::new(store.clone()),
        None,
        ShutdownSettings::default(),
    );

    assert_eq!(report.frames_drained, 7);
    assert_eq!(report.results_flushed, 7);
    assert_eq!(report.buffer.pending, 0);
    assert_eq!(report.buffer.drained, 7);
    let flushes = store.flushes.lock().unwrap();
    assert_eq!(flushes.len(), 1);
    assert_eq!(flushes[0].len(), 7);
    assert_eq!(flushes[0].iter().filter(|r| r.label == "alice").count(), 2);
    Ok(())
}

#[test]
fn buffered_frames_stay_put_when_drain_is_disabled() -> Result<()> {
    let (buffer, signal, roster) = ended_cameras()?;
    let store = RecordingStore {
        path: PathBuf::from("faces.csv"),
        ..RecordingStore::default()
    };

    let report = shutdown_with(
        &buffer,
        &signal,
        roster,
        Box::new(store.clone()),
        None,
        ShutdownSettings {
            drain_on_shutdown: false,
            ..ShutdownSettings::default()
        },
    );

    assert_eq!(report.frames_drained, 0);
    assert_eq!(report.buffer.pending, 7);
    assert_eq!(report.buffer.drained, 0);
    assert_eq!(report.results_flushed, 0);
    let flushes = store.flushes.lock().unwrap();
    assert_eq!(flushes.len(), 1);
    assert!(flushes[0].is_empty());
    Ok(())
}

#[test]
fn failed_flush_skips_the_report_but_shutdown_completes() -> Result<()> {
    let (buffer, signal, roster) = ended_cameras()?;
    let store = FailingStore::default();
    let mailer = RecordingMailer::default();

    let report = shutdown_with(
        &buffer,
        &signal,
        roster,
        Box::new(store.clone()),
        Some(delivery(&mailer)),
        ShutdownSettings::default(),
    );

    assert!(signal.is_raised());
    assert_eq!(*store.attempts.lock().unwrap(), 1);
    assert_eq!(report.frames_drained, 7);
    assert_eq!(report.results_flushed, 0);
    assert_eq!(report.artifact, None);
    assert!(!report.report_sent);
    assert!(mailer.sent.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn failed_send_is_reported_after_a_single_flush() -> Result<()> {
    let (buffer, signal, roster) = ended_cameras()?;
    let store = RecordingStore {
        path: PathBuf::from("faces.csv"),
        ..RecordingStore::default()
    };
    let mailer = FailingMailer::default();

    let report = shutdown_with(
        &buffer,
        &signal,
        roster,
        Box::new(store.clone()),
        Some(ReportDelivery {
            mailer: Box::new(mailer.clone()),
            sender: "cams@example.com".to_string(),
            receiver: "ops@example.com".to_string(),
        }),
        ShutdownSettings::default(),
    );

    assert!(!report.report_sent);
    assert_eq!(*mailer.attempts.lock().unwrap(), 1);
    assert_eq!(report.artifact, Some(PathBuf::from("faces.csv")));
    assert_eq!(report.results_flushed, 7);
    assert_eq!(store.flushes.lock().unwrap().len(), 1);
    Ok(())
}

#[test]
fn blocked_producer_is_detached_after_join_timeout() -> Result<()> {
    let buffer = Arc::new(FrameBuffer::unbounded());
    let signal = ShutdownSignal::new();
    let mut roster = ProducerRoster::new(producer_context(&buffer, &signal));
    // The validation read alone blocks for 3s, well past the join timeout.
    roster.spawn(CameraSpec::new("slow", "stub://slow?interval_ms=3000&width=8&height=8"))?;

    let store = RecordingStore {
        path: PathBuf::from("faces.csv"),
        ..RecordingStore::default()
    };
    let started = Instant::now();
    let report = shutdown_with(
        &buffer,
        &signal,
        roster,
        Box::new(store.clone()),
        None,
        ShutdownSettings {
            join_timeout: Duration::from_millis(100),
            ..ShutdownSettings::default()
        },
    );

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.stragglers, vec!["slow".to_string()]);
    assert_eq!(report.results_flushed, 0);
    assert_eq!(store.flushes.lock().unwrap().len(), 1);
    Ok(())
}
