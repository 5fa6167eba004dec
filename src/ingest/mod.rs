//! Camera sources.
//!
//! A `CameraSource` owns one capture handle and produces decoded frames on demand.
//! The transport is picked from the URL scheme:
//! - `http://`, `https://`: MJPEG over HTTP or JPEG snapshots (IP webcams)
//! - `rtsp://`: GStreamer decode (feature: rtsp-gstreamer)
//! - `stub://`: synthetic frames for tests and dry runs
//!
//! Lifecycle: `Uninitialized -> Live -> (Failed | Released)`. Once a source leaves
//! `Live` no further reads are attempted. `release()` is idempotent and may be
//! called from another thread through a `ReleaseHandle`.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use url::Url;

use crate::error::PipelineError;
use crate::frame::Frame;

mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
mod rtsp;
mod synthetic;

use mjpeg::HttpSource;
#[cfg(feature = "rtsp-gstreamer")]
use rtsp::GstreamerSource;
use synthetic::SyntheticSource;

pub const DEFAULT_CAPTURE_BUFFER_FRAMES: usize = 256;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-level options shared by every camera.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceOptions {
    /// Pending frames the transport may hold before dropping the oldest.
    /// Distinct from the application `FrameBuffer`.
    pub capture_buffer_frames: usize,
    /// Upper bound on a single blocking read, where the transport supports one.
    pub read_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            capture_buffer_frames: DEFAULT_CAPTURE_BUFFER_FRAMES,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Uninitialized,
    Live,
    Failed,
    Released,
}

type InterruptHook = Box<dyn Fn() + Send + Sync>;

struct SourceShared {
    state: Mutex<SourceState>,
    /// Unblocks a read in progress on the owning thread.
    interrupt: Option<InterruptHook>,
}

impl SourceShared {
    fn state(&self) -> SourceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SourceState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SourceState::Released {
            *state = next;
        }
    }

    /// Returns true only for the call that performed the transition.
    fn mark_released(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SourceState::Released {
            return false;
        }
        *state = SourceState::Released;
        true
    }
}

/// One camera stream. Exactly one owner: the producer that opened it.
pub struct CameraSource {
    name: String,
    target: String,
    backend: Option<CaptureBackend>,
    shared: Arc<SourceShared>,
    frames_read: u64,
}

impl CameraSource {
    /// Connect and validate liveness with one read.
    pub fn open(name: &str, target: &str, options: &SourceOptions) -> Result<Self, PipelineError> {
        let connect_failed = |reason: String| PipelineError::ConnectFailed {
            camera: name.to_string(),
            reason,
        };

        let mut backend =
            CaptureBackend::connect(target, options).map_err(|e| connect_failed(format!("{:#}", e)))?;
        let shared = Arc::new(SourceShared {
            state: Mutex::new(SourceState::Uninitialized),
            interrupt: backend.interrupt_hook(),
        });

        backend
            .read_frame()
            .map_err(|e| connect_failed(format!("validation read failed: {:#}", e)))?;
        shared.set_state(SourceState::Live);

        log::info!(
            "camera stream from {} (url: {}) initialized",
            name,
            redact_url(target)
        );
        Ok(Self {
            name: name.to_string(),
            target: target.to_string(),
            backend: Some(backend),
            shared,
            frames_read: 1,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> SourceState {
        self.shared.state()
    }

    pub fn is_live(&self) -> bool {
        self.state() == SourceState::Live
    }

    /// Frames read from the transport so far, including the validation read.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Blocking read of the next frame.
    ///
    /// Any transport failure moves the source to `Failed`; it is never retried.
    pub fn read_frame(&mut self) -> Result<Frame, PipelineError> {
        match self.state() {
            SourceState::Live => {}
            SourceState::Released => return Err(self.released()),
            SourceState::Uninitialized | SourceState::Failed => {
                return Err(PipelineError::StreamEnded {
                    camera: self.name.clone(),
                    reason: "source is not live".to_string(),
                })
            }
        }
        let Some(backend) = self.backend.as_mut() else {
            return Err(self.released());
        };

        let result = backend.read_frame();
        // A release from another thread may have raced with the read.
        if self.state() == SourceState::Released {
            return Err(self.released());
        }
        match result {
            Ok(frame) => {
                self.frames_read += 1;
                Ok(frame)
            }
            Err(err) => {
                self.shared.set_state(SourceState::Failed);
                Err(PipelineError::StreamEnded {
                    camera: self.name.clone(),
                    reason: format!("{:#}", err),
                })
            }
        }
    }

    /// Release the capture handle. Idempotent; returns whether this call released it.
    pub fn release(&mut self) -> bool {
        let released = self.shared.mark_released();
        self.backend = None;
        if released {
            log::info!("camera stream from {} released", self.name);
        }
        released
    }

    /// Handle that can release this source from another thread.
    pub fn release_handle(&self) -> ReleaseHandle {
        ReleaseHandle {
            camera: self.name.clone(),
            shared: self.shared.clone(),
        }
    }

    fn released(&mut self) -> PipelineError {
        self.backend = None;
        PipelineError::SourceReleased {
            camera: self.name.clone(),
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cross-thread release for a `CameraSource`.
///
/// Marks the source released and interrupts a blocked read where the transport
/// allows it; the owning thread drops the handle on its next access.
#[derive(Clone)]
pub struct ReleaseHandle {
    camera: String,
    shared: Arc<SourceShared>,
}

impl ReleaseHandle {
    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn is_released(&self) -> bool {
        self.shared.state() == SourceState::Released
    }

    /// Idempotent; returns whether this call released the source.
    pub fn release(&self) -> bool {
        let released = self.shared.mark_released();
        if released {
            if let Some(interrupt) = &self.shared.interrupt {
                interrupt();
            }
            log::info!("camera stream from {} released", self.camera);
        }
        released
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("camera", &self.camera)
            .field("state", &self.shared.state())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Transport selection
// ----------------------------------------------------------------------------

enum CaptureBackend {
    Synthetic(SyntheticSource),
    Http(HttpSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl CaptureBackend {
    fn connect(target: &str, options: &SourceOptions) -> Result<Self> {
        let url = Url::parse(target)
            .with_context(|| format!("parse camera url {}", redact_url(target)))?;
        match url.scheme() {
            "stub" => Ok(Self::Synthetic(SyntheticSource::new(&url)?)),
            "http" | "https" => Ok(Self::Http(HttpSource::connect(target, options)?)),
            "rtsp" | "rtsps" => {
                #[cfg(feature = "rtsp-gstreamer")]
                {
                    Ok(Self::Gstreamer(GstreamerSource::connect(target, options)?))
                }
                #[cfg(not(feature = "rtsp-gstreamer"))]
                {
                    bail!("RTSP cameras require the rtsp-gstreamer feature")
                }
            }
            other => bail!("unsupported camera url scheme '{}'", other),
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        match self {
            Self::Synthetic(source) => source.read_frame(),
            Self::Http(source) => source.read_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            Self::Gstreamer(source) => source.read_frame(),
        }
    }

    fn interrupt_hook(&self) -> Option<InterruptHook> {
        match self {
            Self::Synthetic(_) => None,
            Self::Http(source) => source.interrupt_hook(),
            #[cfg(feature = "rtsp-gstreamer")]
            Self::Gstreamer(source) => Some(source.interrupt_hook()),
        }
    }
}

/// Camera URL with any embedded password masked, for logs.
pub fn redact_url(target: &str) -> String {
    match Url::parse(target) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("***")).is_err() {
                return "<unprintable url>".to_string();
            }
            url.to_string()
        }
        _ => target.to_string(),
    }
}
