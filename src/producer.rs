//! Camera producer loops.
//!
//! One thread per camera. Each iteration either reads, normalizes and buffers a
//! frame, or reads and discards one, alternating between the two (1-in-2 sampling).
//! The first frame after the validation read is always processed; the phase is
//! independent per camera.
//!
//! Any read failure is terminal for that camera: the source is released, the exit
//! is reported on the event channel, and the thread ends. Nothing is retried.

use anyhow::{Context, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::frame::{AppendOutcome, FrameBuffer, FrameEntry, ResizePolicy};
use crate::ingest::{redact_url, CameraSource, ReleaseHandle, SourceOptions};
use crate::shutdown::ShutdownSignal;

/// A configured camera: identity plus connection target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraSpec {
    pub name: String,
    pub url: String,
}

impl CameraSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Everything a producer shares with the rest of the process.
#[derive(Clone)]
pub struct ProducerContext {
    pub buffer: Arc<FrameBuffer>,
    pub signal: ShutdownSignal,
    pub resize: ResizePolicy,
    pub source_options: SourceOptions,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The stop signal was observed.
    Stopped,
    /// The source was released from another thread.
    Released,
    StreamEnded(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerExit {
    pub camera: String,
    pub reason: ExitReason,
    /// Frames appended to the buffer.
    pub buffered: u64,
    /// Frames read from the source, including the validation read.
    pub frames_read: u64,
}

/// Structured lifecycle reports sent from producer threads.
#[derive(Debug)]
pub enum ProducerEvent {
    Started {
        camera: String,
        release: ReleaseHandle,
    },
    ConnectFailed {
        camera: String,
        reason: String,
    },
    Exited(ProducerExit),
}

/// Per-camera control loop.
pub struct CameraProducer {
    source: CameraSource,
    buffer: Arc<FrameBuffer>,
    signal: ShutdownSignal,
    resize: ResizePolicy,
    process_this_frame: bool,
    buffered: u64,
}

impl CameraProducer {
    pub fn new(source: CameraSource, ctx: &ProducerContext) -> Self {
        Self {
            source,
            buffer: ctx.buffer.clone(),
            signal: ctx.signal.clone(),
            resize: ctx.resize,
            process_this_frame: true,
            buffered: 0,
        }
    }

    /// One sampling iteration. An error means the camera is done.
    pub fn step(&mut self) -> Result<(), PipelineError> {
        if self.process_this_frame {
            let frame = self.source.read_frame()?;
            match self.resize.apply(frame) {
                Ok(frame) => {
                    let sequence = self.buffered + 1;
                    let entry =
                        FrameEntry::new(frame, self.source.name(), self.source.target(), sequence);
                    match self.buffer.append(entry) {
                        AppendOutcome::Appended => self.buffered = sequence,
                        AppendOutcome::EvictedOldest => {
                            self.buffered = sequence;
                            log::debug!("frame buffer full; oldest entry evicted");
                        }
                        AppendOutcome::Rejected => {
                            log::debug!(
                                "frame buffer full; frame from {} dropped",
                                self.source.name()
                            );
                        }
                    }
                }
                Err(err) => log::warn!(
                    "skipping frame from {}: resize failed: {:#}",
                    self.source.name(),
                    err
                ),
            }
        } else {
            self.source.read_frame()?;
        }

        self.process_this_frame = !self.process_this_frame;
        Ok(())
    }

    /// Run until the source fails or the stop signal is raised.
    pub fn run(mut self) -> ProducerExit {
        let reason = loop {
            if self.signal.is_raised() {
                break ExitReason::Stopped;
            }
            match self.step() {
                Ok(()) => {}
                Err(PipelineError::SourceReleased { .. }) => break ExitReason::Released,
                Err(err) => {
                    log::error!(
                        "could not read a frame from {} (url: {}): {}. releasing the stream",
                        self.source.name(),
                        redact_url(self.source.target()),
                        err
                    );
                    break ExitReason::StreamEnded(err.to_string());
                }
            }
        };
        self.source.release();
        ProducerExit {
            camera: self.source.name().to_string(),
            reason,
            buffered: self.buffered,
            frames_read: self.source.frames_read(),
        }
    }
}

// ----------------------------------------------------------------------------
// Roster: spawning and tracking producer threads
// ----------------------------------------------------------------------------

/// Spawns producer threads and tracks them through their event channel.
pub struct ProducerRoster {
    ctx: ProducerContext,
    events_tx: Sender<ProducerEvent>,
    events_rx: Receiver<ProducerEvent>,
    threads: Vec<(String, JoinHandle<()>)>,
    releases: Vec<ReleaseHandle>,
    exits: Vec<ProducerExit>,
    connect_failures: Vec<(String, String)>,
    outstanding: usize,
}

impl ProducerRoster {
    pub fn new(ctx: ProducerContext) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            ctx,
            events_tx,
            events_rx,
            threads: Vec::new(),
            releases: Vec::new(),
            exits: Vec::new(),
            connect_failures: Vec::new(),
            outstanding: 0,
        }
    }

    /// Start a producer thread. Connecting happens on that thread.
    pub fn spawn(&mut self, camera: CameraSpec) -> Result<()> {
        let ctx = self.ctx.clone();
        let tx = self.events_tx.clone();
        let thread_name = format!("camera-{}", camera.name);
        let name = camera.name.clone();
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run_producer(camera, ctx, tx))
            .with_context(|| format!("spawn producer thread for {}", name))?;
        self.threads.push((name, handle));
        self.outstanding += 1;
        Ok(())
    }

    /// Apply pending events. Returns the number of producers still running.
    pub fn poll(&mut self) -> usize {
        while let Ok(event) = self.events_rx.try_recv() {
            self.record(event);
        }
        self.outstanding
    }

    /// Block until every producer has exited or `timeout` elapses.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        while self.poll() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.events_rx.recv_timeout(remaining) {
                Ok(event) => self.record(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.outstanding
    }

    /// Release every known camera source. Returns how many this call released.
    pub fn release_all(&mut self) -> usize {
        self.poll();
        self.releases.iter().filter(|handle| handle.release()).count()
    }

    /// Join producer threads, waiting at most `timeout` in total.
    ///
    /// Returns the cameras whose threads were still running at the deadline.
    pub fn join_all(&mut self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        let mut stragglers = Vec::new();
        for (camera, handle) in self.threads.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("producer thread for {} panicked", camera);
                }
            } else {
                stragglers.push(camera);
            }
        }
        self.poll();
        stragglers
    }

    pub fn exits(&self) -> &[ProducerExit] {
        &self.exits
    }

    pub fn connect_failures(&self) -> &[(String, String)] {
        &self.connect_failures
    }

    fn record(&mut self, event: ProducerEvent) {
        match event {
            ProducerEvent::Started { camera, release } => {
                log::debug!("producer for {} started", camera);
                self.releases.push(release);
            }
            ProducerEvent::ConnectFailed { camera, reason } => {
                self.connect_failures.push((camera, reason));
                self.outstanding = self.outstanding.saturating_sub(1);
            }
            ProducerEvent::Exited(exit) => {
                log::info!(
                    "producer for {} exited ({:?}); {} frames buffered of {} read",
                    exit.camera,
                    exit.reason,
                    exit.buffered,
                    exit.frames_read
                );
                self.exits.push(exit);
                self.outstanding = self.outstanding.saturating_sub(1);
            }
        }
    }
}

fn run_producer(camera: CameraSpec, ctx: ProducerContext, events: Sender<ProducerEvent>) {
    let source = match CameraSource::open(&camera.name, &camera.url, &ctx.source_options) {
        Ok(source) => source,
        Err(err) => {
            log::error!("{}", err);
            let _ = events.send(ProducerEvent::ConnectFailed {
                camera: camera.name,
                reason: err.to_string(),
            });
            return;
        }
    };
    let _ = events.send(ProducerEvent::Started {
        camera: camera.name.clone(),
        release: source.release_handle(),
    });
    let exit = CameraProducer::new(source, &ctx).run();
    let _ = events.send(ProducerEvent::Exited(exit));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(buffer: Arc<FrameBuffer>) -> ProducerContext {
        ProducerContext {
            buffer,
            signal: ShutdownSignal::new(),
            resize: ResizePolicy::default(),
            source_options: SourceOptions::default(),
        }
    }

    fn open(url: &str) -> CameraSource {
        CameraSource::open("cam1", url, &SourceOptions::default()).expect("open stub camera")
    }

    #[test]
    fn alternate_sampling_buffers_half_the_reads() {
        // 1 validation read + 2m = 12 sampled reads, then the stream ends.
        let buffer = Arc::new(FrameBuffer::unbounded());
        let ctx = context(buffer.clone());
        let exit = CameraProducer::new(open("stub://cam1?frames=13&width=8&height=8"), &ctx).run();

        assert_eq!(exit.frames_read, 13);
        assert_eq!(exit.buffered, 6);
        assert!(matches!(exit.reason, ExitReason::StreamEnded(_)));
        let seqs: Vec<u64> = buffer.drain_up_to(100).iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn discard_read_failure_is_terminal() {
        let buffer = Arc::new(FrameBuffer::unbounded());
        let ctx = context(buffer.clone());
        // Validation read, one buffered read, then the discard read fails.
        let exit = CameraProducer::new(open("stub://cam1?frames=2&width=8&height=8"), &ctx).run();
        assert_eq!(exit.buffered, 1);
        assert!(matches!(exit.reason, ExitReason::StreamEnded(_)));
    }

    #[test]
    fn oversize_frames_are_normalized_before_buffering() {
        let buffer = Arc::new(FrameBuffer::unbounded());
        let mut ctx = context(buffer.clone());
        ctx.resize = ResizePolicy {
            max_width: 16,
            max_height: 16,
            target_width: 8,
            target_height: 4,
        };
        CameraProducer::new(open("stub://cam1?frames=3&width=32&height=20"), &ctx).run();
        let entries = buffer.drain_up_to(10);
        assert_eq!(entries.len(), 1);
        assert_eq!((entries[0].frame.width, entries[0].frame.height), (8, 4));
        assert_eq!(entries[0].camera, "cam1");
    }

    #[test]
    fn stop_signal_ends_loop_and_releases_source() {
        let buffer = Arc::new(FrameBuffer::unbounded());
        let ctx = context(buffer);
        ctx.signal.raise();
        let source = open("stub://cam1?width=8&height=8");
        let handle = source.release_handle();
        let exit = CameraProducer::new(source, &ctx).run();
        assert_eq!(exit.reason, ExitReason::Stopped);
        assert_eq!(exit.buffered, 0);
        assert!(handle.is_released());
    }

    #[test]
    fn roster_tracks_connect_failures_and_exits() {
        let buffer = Arc::new(FrameBuffer::unbounded());
        let mut roster = ProducerRoster::new(context(buffer.clone()));
        roster
            .spawn(CameraSpec::new("dead", "stub://dead?frames=0"))
            .unwrap();
        roster
            .spawn(CameraSpec::new("short", "stub://short?frames=5&width=8&height=8"))
            .unwrap();

        assert_eq!(roster.wait_for_exit(Duration::from_secs(10)), 0);
        assert!(roster.join_all(Duration::from_secs(5)).is_empty());
        assert_eq!(roster.connect_failures().len(), 1);
        assert_eq!(roster.connect_failures()[0].0, "dead");
        assert_eq!(roster.exits().len(), 1);
        assert_eq!(roster.exits()[0].buffered, 2);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn release_all_stops_endless_cameras() {
        let buffer = Arc::new(FrameBuffer::unbounded());
        let mut roster = ProducerRoster::new(context(buffer));
        roster
            .spawn(CameraSpec::new("cam1", "stub://cam1?width=4&height=4&interval_ms=1"))
            .unwrap();

        // Wait until the producer has reported its release handle.
        let deadline = Instant::now() + Duration::from_secs(10);
        while roster.releases.is_empty() && Instant::now() < deadline {
            roster.poll();
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(roster.release_all(), 1);
        assert_eq!(roster.release_all(), 0);
        assert!(roster.join_all(Duration::from_secs(5)).is_empty());
        assert_eq!(roster.poll(), 0);
        assert_eq!(roster.exits()[0].reason, ExitReason::Released);
    }
}
