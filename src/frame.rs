//! Frames and the shared frame buffer.
//!
//! - `Frame`: one decoded RGB image sampled from a camera.
//! - `FrameEntry`: a frame tagged with the camera it came from. Never mutated after creation.
//! - `ResizePolicy`: downscale rule applied by producers before buffering.
//! - `FrameBuffer`: FIFO shared by every camera producer and the batch dispatcher.
//!
//! The buffer is the only synchronization point between producers and the dispatcher.
//! Its single mutex is held for the duration of an append or a drain, never across
//! I/O or recognition calls.

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const DEFAULT_FRAME_WIDTH: u32 = 1280;
pub const DEFAULT_FRAME_HEIGHT: u32 = 720;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded RGB24 frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap packed RGB24 pixels. The pixel length must match the dimensions.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// True when either dimension is larger than the given bound.
    pub fn exceeds(&self, max_width: u32, max_height: u32) -> bool {
        self.height > max_height || self.width > max_width
    }

    /// Resize to exactly `width` x `height`. Aspect ratio is not preserved.
    pub fn resized(self, width: u32, height: u32) -> Result<Self> {
        let (src_width, src_height) = (self.width, self.height);
        let image = RgbImage::from_raw(src_width, src_height, self.pixels).ok_or_else(|| {
            anyhow!(
                "frame buffer too small for {}x{} image",
                src_width,
                src_height
            )
        })?;
        let resized = image::imageops::resize(&image, width, height, FilterType::Triangle);
        Ok(Self {
            pixels: resized.into_raw(),
            width,
            height,
        })
    }

    /// Encode as baseline JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(
                &self.pixels,
                self.width,
                self.height,
                image::ExtendedColorType::Rgb8,
            )
            .context("encode frame as jpeg")?;
        Ok(out)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Downscale rule: frames larger than the max bounds are resized to the target size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizePolicy {
    pub max_width: u32,
    pub max_height: u32,
    pub target_width: u32,
    pub target_height: u32,
}

impl Default for ResizePolicy {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_FRAME_WIDTH,
            max_height: DEFAULT_FRAME_HEIGHT,
            target_width: DEFAULT_FRAME_WIDTH,
            target_height: DEFAULT_FRAME_HEIGHT,
        }
    }
}

impl ResizePolicy {
    /// Resize `frame` if it exceeds the bounds; frames within bounds pass through untouched.
    pub fn apply(&self, frame: Frame) -> Result<Frame> {
        if frame.exceeds(self.max_width, self.max_height) {
            frame.resized(self.target_width, self.target_height)
        } else {
            Ok(frame)
        }
    }
}

// ----------------------------------------------------------------------------
// FrameEntry
// ----------------------------------------------------------------------------

/// A buffered frame plus the identity of the camera that produced it.
#[derive(Debug)]
pub struct FrameEntry {
    pub frame: Frame,
    pub camera: String,
    pub target: String,
    /// Per-camera capture sequence (counts buffered frames, starting at 1).
    pub sequence: u64,
}

impl FrameEntry {
    pub fn new(frame: Frame, camera: &str, target: &str, sequence: u64) -> Self {
        Self {
            frame,
            camera: camera.to_string(),
            target: target.to_string(),
            sequence,
        }
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// What a bounded buffer does when an append finds it full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    DropNewest,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferCapacity {
    /// Grow without limit. Capture never stalls, memory is unbounded.
    #[default]
    Unbounded,
    Bounded {
        max_entries: usize,
        overflow: OverflowPolicy,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Entry appended after evicting the oldest buffered entry.
    EvictedOldest,
    /// Buffer full; the new entry was discarded.
    Rejected,
}

/// Counters since construction. `appended == drained + dropped + pending` always holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub appended: u64,
    pub drained: u64,
    pub dropped: u64,
    pub pending: usize,
}

#[derive(Default)]
struct BufferState {
    entries: VecDeque<FrameEntry>,
    appended: u64,
    drained: u64,
    dropped: u64,
}

/// Shared FIFO of frame entries: many producers append, one dispatcher drains.
pub struct FrameBuffer {
    state: Mutex<BufferState>,
    ready: Condvar,
    capacity: BufferCapacity,
}

impl FrameBuffer {
    pub fn new(capacity: BufferCapacity) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            ready: Condvar::new(),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(BufferCapacity::Unbounded)
    }

    pub fn capacity(&self) -> BufferCapacity {
        self.capacity
    }

    // Critical sections only touch the deque and counters and cannot panic midway,
    // so a poisoned lock still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry at the end, applying the overflow policy when bounded.
    pub fn append(&self, entry: FrameEntry) -> AppendOutcome {
        let outcome = {
            let mut state = self.lock();
            state.appended += 1;
            match self.capacity {
                BufferCapacity::Bounded {
                    max_entries,
                    overflow,
                } if state.entries.len() >= max_entries => match overflow {
                    OverflowPolicy::DropOldest => {
                        state.entries.pop_front();
                        state.entries.push_back(entry);
                        state.dropped += 1;
                        AppendOutcome::EvictedOldest
                    }
                    OverflowPolicy::DropNewest => {
                        state.dropped += 1;
                        AppendOutcome::Rejected
                    }
                },
                _ => {
                    state.entries.push_back(entry);
                    AppendOutcome::Appended
                }
            }
        };
        if outcome != AppendOutcome::Rejected {
            self.ready.notify_one();
        }
        outcome
    }

    /// Remove and return at most `max` of the oldest entries. Never waits.
    pub fn drain_up_to(&self, max: usize) -> Vec<FrameEntry> {
        let mut state = self.lock();
        let take = max.min(state.entries.len());
        let batch: Vec<FrameEntry> = state.entries.drain(..take).collect();
        state.drained += batch.len() as u64;
        batch
    }

    /// Block until an entry is available, `notify_all` is called, or `timeout` elapses.
    ///
    /// Returns whether entries are pending on wake-up.
    pub fn wait_for_entries(&self, timeout: Duration) -> bool {
        let state = self.lock();
        if !state.entries.is_empty() {
            return true;
        }
        let (state, _) = self
            .ready
            .wait_timeout(state, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        !state.entries.is_empty()
    }

    /// Wake every waiter (used when stopping).
    pub fn notify_all(&self) {
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.lock();
        BufferStats {
            appended: state.appended,
            drained: state.drained,
            dropped: state.dropped,
            pending: state.entries.len(),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::unbounded()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
