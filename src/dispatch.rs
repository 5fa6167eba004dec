//! Batch dispatcher: the single consumer of the frame buffer.
//!
//! Drains up to `batch_size` entries at a time, runs recognition on each frame and
//! accumulates one result per detected face. When the buffer is empty it waits for
//! an append (or `idle_backoff`) instead of spinning.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::FrameBuffer;
use crate::recognize::{FaceRecognizer, KnownFaceSet, DEFAULT_TOLERANCE, DEFAULT_UPSAMPLE};
use crate::results::{RecognitionResult, ResultAccumulator};

pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, PartialEq)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub tolerance: f64,
    pub upsample: u32,
    pub idle_backoff: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            tolerance: DEFAULT_TOLERANCE,
            upsample: DEFAULT_UPSAMPLE,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        }
    }
}

pub struct BatchDispatcher<R: FaceRecognizer> {
    buffer: Arc<FrameBuffer>,
    recognizer: R,
    known: Arc<KnownFaceSet>,
    settings: DispatchSettings,
    results: ResultAccumulator,
    batches: u64,
    frames: u64,
    skipped: u64,
}

impl<R: FaceRecognizer> BatchDispatcher<R> {
    pub fn new(
        buffer: Arc<FrameBuffer>,
        recognizer: R,
        known: Arc<KnownFaceSet>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            buffer,
            recognizer,
            known,
            settings,
            results: ResultAccumulator::new(),
            batches: 0,
            frames: 0,
            skipped: 0,
        }
    }

    /// Drain and process one batch. Returns the number of frames taken; never waits.
    pub fn dispatch_once(&mut self) -> usize {
        let batch = self.buffer.drain_up_to(self.settings.batch_size.max(1));
        if batch.is_empty() {
            return 0;
        }
        self.batches += 1;

        for entry in &batch {
            self.frames += 1;
            let faces = match self.recognizer.recognize(
                &entry.frame,
                &self.known,
                self.settings.tolerance,
                self.settings.upsample,
            ) {
                Ok(faces) => faces,
                Err(err) => {
                    self.skipped += 1;
                    log::warn!(
                        "recognition failed for frame {} from {}: {:#}",
                        entry.sequence,
                        entry.camera,
                        err
                    );
                    continue;
                }
            };

            let recognized_at = Utc::now();
            for face in faces {
                log::debug!("{} saw {}", entry.camera, face.label);
                self.results
                    .push(RecognitionResult::from_face(entry, face, recognized_at));
            }
        }
        batch.len()
    }

    /// Dispatch until `keep_running` returns false.
    ///
    /// `keep_running` is checked before every drain, so a raised stop signal is
    /// noticed within one batch or one idle backoff.
    pub fn run_until<F: FnMut() -> bool>(&mut self, mut keep_running: F) {
        while keep_running() {
            if self.dispatch_once() == 0 {
                self.buffer.wait_for_entries(self.settings.idle_backoff);
            }
        }
    }

    /// Dispatch everything currently buffered. Returns the number of frames taken.
    pub fn drain_remaining(&mut self) -> usize {
        let mut total = 0;
        loop {
            let taken = self.dispatch_once();
            if taken == 0 {
                return total;
            }
            total += taken;
        }
    }

    pub fn results(&self) -> &ResultAccumulator {
        &self.results
    }

    pub fn into_results(self) -> ResultAccumulator {
        self.results
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames
    }

    /// Frames dropped because recognition failed.
    pub fn frames_skipped(&self) -> u64 {
        self.skipped
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }
}
