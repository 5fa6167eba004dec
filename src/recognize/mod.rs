//! Face recognition: backends locate faces and encode them, the recognizer names
//! them against the known-face set.

mod backend;
mod known_faces;
mod remote;

use anyhow::Result;

pub use backend::{BoundingBox, DetectedFace, FaceBackend, NoFaceBackend};
pub use known_faces::{face_distance, FaceMatch, KnownFace, KnownFaceSet};
pub use remote::{RemoteBackend, DEFAULT_REMOTE_TIMEOUT};

use crate::frame::Frame;

pub const UNKNOWN_LABEL: &str = "unknown";
pub const DEFAULT_TOLERANCE: f64 = 0.4;
pub const DEFAULT_UPSAMPLE: u32 = 1;

/// One face found in a frame, named or `"unknown"`.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognizedFace {
    pub label: String,
    /// Distance to the matched encoding; `None` for unknown faces.
    pub distance: Option<f64>,
    pub location: BoundingBox,
}

impl RecognizedFace {
    pub fn is_known(&self) -> bool {
        self.distance.is_some()
    }
}

/// Recognition capability consumed by the dispatcher.
pub trait FaceRecognizer {
    fn recognize(
        &mut self,
        frame: &Frame,
        known: &KnownFaceSet,
        tolerance: f64,
        upsample: u32,
    ) -> Result<Vec<RecognizedFace>>;
}

/// Combines a [`FaceBackend`] with the tolerance rule.
pub struct Recognizer<B: FaceBackend> {
    backend: B,
}

impl<B: FaceBackend> Recognizer<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.backend.warm_up()
    }
}

impl<B: FaceBackend> FaceRecognizer for Recognizer<B> {
    fn recognize(
        &mut self,
        frame: &Frame,
        known: &KnownFaceSet,
        tolerance: f64,
        upsample: u32,
    ) -> Result<Vec<RecognizedFace>> {
        let detected = self.backend.detect_faces(frame, upsample)?;
        detected
            .into_iter()
            .map(|face| {
                let named = known.best_match(&face.encoding, tolerance)?;
                Ok(match named {
                    Some(hit) => RecognizedFace {
                        label: hit.name.to_string(),
                        distance: Some(hit.distance),
                        location: face.location,
                    },
                    None => RecognizedFace {
                        label: UNKNOWN_LABEL.to_string(),
                        distance: None,
                        location: face.location,
                    },
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBackend(Vec<Vec<f64>>);

    impl FaceBackend for FixedBackend {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect_faces(&mut self, _frame: &Frame, _upsample: u32) -> Result<Vec<DetectedFace>> {
            Ok(self
                .0
                .iter()
                .enumerate()
                .map(|(i, encoding)| DetectedFace {
                    location: BoundingBox::new(i as u32, 10, 10, 0),
                    encoding: encoding.clone(),
                })
                .collect())
        }
    }

    #[test]
    fn names_known_faces_and_marks_the_rest_unknown() -> Result<()> {
        let known = KnownFaceSet::new(vec![KnownFace {
            name: "alice".to_string(),
            encoding: vec![0.0, 0.0],
        }])?;
        let mut recognizer = Recognizer::new(FixedBackend(vec![vec![0.4, 0.0], vec![2.0, 2.0]]));
        let frame = Frame::from_rgb(vec![0u8; 4 * 4 * 3], 4, 4)?;

        let faces = recognizer.recognize(&frame, &known, DEFAULT_TOLERANCE, DEFAULT_UPSAMPLE)?;
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].label, "alice");
        assert!(faces[0].is_known());
        assert_eq!(faces[1].label, UNKNOWN_LABEL);
        assert_eq!(faces[1].distance, None);
        assert_eq!(faces[1].location.top, 1);
        Ok(())
    }

    #[test]
    fn empty_known_set_yields_unknown() -> Result<()> {
        let mut recognizer = Recognizer::new(FixedBackend(vec![vec![0.0]]));
        let frame = Frame::from_rgb(vec![0u8; 3], 1, 1)?;
        let faces = recognizer.recognize(&frame, &KnownFaceSet::default(), 0.4, 1)?;
        assert_eq!(faces[0].label, UNKNOWN_LABEL);
        Ok(())
    }

    #[test]
    fn no_face_backend_finds_nothing() -> Result<()> {
        let mut recognizer: Recognizer<Box<dyn FaceBackend>> =
            Recognizer::new(Box::new(NoFaceBackend));
        assert_eq!(recognizer.backend_name(), "none");
        let frame = Frame::from_rgb(vec![0u8; 3], 1, 1)?;
        assert!(recognizer
            .recognize(&frame, &KnownFaceSet::default(), 0.4, 1)?
            .is_empty());
        Ok(())
    }
}
