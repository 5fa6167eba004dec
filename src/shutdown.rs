//! Coordinated shutdown.
//!
//! Triggered by an interrupt or by every camera exiting. The sequence always runs to
//! completion, even when some cameras already failed on their own:
//! 1. Raise the stop signal (no further buffer appends)
//! 2. Release every camera source
//! 3. Join producer threads, bounded by `join_timeout`
//! 4. Dispatch whatever is still buffered (when `drain_on_shutdown`)
//! 5. Flush accumulated results to the result store
//! 6. Send the summary report exactly once
//!
//! Failures in steps 5 and 6 are logged; shutdown is best-effort, not transactional.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::BatchDispatcher;
use crate::frame::{BufferStats, FrameBuffer};
use crate::producer::ProducerRoster;
use crate::recognize::FaceRecognizer;
use crate::report::{EmailMessage, Mailer};
use crate::results::ResultStore;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Process-wide cooperative stop flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    raised: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the call that raised the signal.
    pub fn raise(&self) -> bool {
        !self.raised.swap(true, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownSettings {
    pub join_timeout: Duration,
    pub drain_on_shutdown: bool,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            drain_on_shutdown: true,
        }
    }
}

/// Where the summary report goes.
pub struct ReportDelivery {
    pub mailer: Box<dyn Mailer>,
    pub sender: String,
    pub receiver: String,
}

/// Outcome of a shutdown run.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub cameras_released: usize,
    /// Producers still running when the join timeout expired.
    pub stragglers: Vec<String>,
    pub frames_drained: usize,
    pub results_flushed: usize,
    pub artifact: Option<PathBuf>,
    pub report_sent: bool,
    pub buffer: BufferStats,
}

pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
    buffer: Arc<FrameBuffer>,
    store: Box<dyn ResultStore>,
    delivery: Option<ReportDelivery>,
    settings: ShutdownSettings,
}

impl ShutdownCoordinator {
    pub fn new(
        signal: ShutdownSignal,
        buffer: Arc<FrameBuffer>,
        store: Box<dyn ResultStore>,
        delivery: Option<ReportDelivery>,
        settings: ShutdownSettings,
    ) -> Self {
        Self {
            signal,
            buffer,
            store,
            delivery,
            settings,
        }
    }

    pub fn shutdown<R: FaceRecognizer>(
        mut self,
        mut roster: ProducerRoster,
        mut dispatcher: BatchDispatcher<R>,
    ) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        if self.signal.raise() {
            log::info!("stop signal raised");
        }
        self.buffer.notify_all();

        report.cameras_released = roster.release_all();
        log::info!("camera streams released ({})", report.cameras_released);

        report.stragglers = roster.join_all(self.settings.join_timeout);
        for camera in &report.stragglers {
            log::warn!(
                "camera {} did not stop within {:?}; detaching",
                camera,
                self.settings.join_timeout
            );
        }

        if self.settings.drain_on_shutdown {
            report.frames_drained = dispatcher.drain_remaining();
            if report.frames_drained > 0 {
                log::info!("dispatched {} buffered frames", report.frames_drained);
            }
        }
        report.buffer = self.buffer.stats();

        let results = dispatcher.into_results();
        match self.store.flush(results.as_slice()) {
            Ok(path) => {
                report.results_flushed = results.len();
                log::info!(
                    "{} recognition results stored in {}",
                    results.len(),
                    path.display()
                );
                report.artifact = Some(path);
            }
            Err(err) => log::error!("{}", err),
        }

        report.report_sent = self.send_report(report.artifact.as_ref());
        log::info!("shutdown complete");
        report
    }

    fn send_report(&mut self, artifact: Option<&PathBuf>) -> bool {
        let Some(delivery) = self.delivery.as_mut() else {
            log::info!("no mailer configured; summary report not sent");
            return false;
        };
        let Some(artifact) = artifact else {
            log::warn!("no result artifact to attach; summary report not sent");
            return false;
        };

        let message = EmailMessage::summary_report(
            &delivery.sender,
            &delivery.receiver,
            artifact.clone(),
        );
        match delivery.mailer.send(&message) {
            Ok(()) => {
                log::info!("summary report sent to {}", delivery.receiver);
                true
            }
            Err(err) => {
                log::error!("{}", err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_reports_first_raise_only() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();
        assert!(!signal.is_raised());
        assert!(other.raise());
        assert!(!signal.raise());
        assert!(signal.is_raised());
    }
}
