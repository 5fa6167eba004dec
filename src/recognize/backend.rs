use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;

/// Face location in pixel coordinates, `(top, right, bottom, left)` order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }
}

/// A face located by a backend together with its encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedFace {
    pub location: BoundingBox,
    pub encoding: Vec<f64>,
}

/// Face backend trait.
///
/// Locates faces in a frame and computes one encoding per face. Matching against
/// known faces happens in [`Recognizer`](super::Recognizer), not here.
pub trait FaceBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Locate faces and compute their encodings.
    ///
    /// `upsample` is the number of times the image is upsampled before
    /// locating faces; higher values find smaller faces.
    fn detect_faces(&mut self, frame: &Frame, upsample: u32) -> Result<Vec<DetectedFace>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<B: FaceBackend + ?Sized> FaceBackend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect_faces(&mut self, frame: &Frame, upsample: u32) -> Result<Vec<DetectedFace>> {
        (**self).detect_faces(frame, upsample)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}

/// Backend that never finds a face. Used for dry runs and capture-only setups.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFaceBackend;

impl FaceBackend for NoFaceBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn detect_faces(&mut self, _frame: &Frame, _upsample: u32) -> Result<Vec<DetectedFace>> {
        Ok(Vec::new())
    }
}
