use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

/// On-disk layout written by the offline embedding step.
#[derive(Debug, Deserialize)]
struct KnownFaceFile {
    names: Vec<String>,
    encodings: Vec<Vec<f64>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct KnownFace {
    pub name: String,
    pub encoding: Vec<f64>,
}

/// Closest known face within tolerance.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceMatch<'a> {
    pub name: &'a str,
    pub distance: f64,
}

/// Name/encoding associations loaded once at startup. Immutable afterwards.
///
/// A name may appear with several encodings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KnownFaceSet {
    faces: Vec<KnownFace>,
    dimension: usize,
}

impl KnownFaceSet {
    pub fn new(faces: Vec<KnownFace>) -> Result<Self> {
        let dimension = faces.first().map(|f| f.encoding.len()).unwrap_or(0);
        for face in &faces {
            if face.name.trim().is_empty() {
                return Err(anyhow!("known face name must not be empty"));
            }
            if face.encoding.is_empty() {
                return Err(anyhow!("encoding for {} is empty", face.name));
            }
            if face.encoding.len() != dimension {
                return Err(anyhow!(
                    "encoding for {} has {} values, expected {}",
                    face.name,
                    face.encoding.len(),
                    dimension
                ));
            }
            if face.encoding.iter().any(|v| !v.is_finite()) {
                return Err(anyhow!("encoding for {} contains non-finite values", face.name));
            }
        }
        Ok(Self { faces, dimension })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read known faces {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid known faces {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: KnownFaceFile = serde_json::from_str(raw)?;
        if file.names.len() != file.encodings.len() {
            return Err(anyhow!(
                "{} names but {} encodings",
                file.names.len(),
                file.encodings.len()
            ));
        }
        let faces = file
            .names
            .into_iter()
            .zip(file.encodings)
            .map(|(name, encoding)| KnownFace { name, encoding })
            .collect();
        Self::new(faces)
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Encoding length shared by every entry (0 when empty).
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Distinct names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let names: BTreeSet<&str> = self.faces.iter().map(|f| f.name.as_str()).collect();
        names.into_iter().collect()
    }

    /// Closest known face whose distance is at most `tolerance` (inclusive).
    pub fn best_match(&self, encoding: &[f64], tolerance: f64) -> Result<Option<FaceMatch<'_>>> {
        if self.faces.is_empty() {
            return Ok(None);
        }
        if encoding.len() != self.dimension {
            return Err(anyhow!(
                "face encoding has {} values, known faces use {}",
                encoding.len(),
                self.dimension
            ));
        }
        let closest = self
            .faces
            .iter()
            .map(|face| (face, face_distance(&face.encoding, encoding)))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        Ok(closest
            .filter(|(_, distance)| *distance <= tolerance)
            .map(|(face, distance)| FaceMatch {
                name: &face.name,
                distance,
            }))
    }
}

/// Euclidean distance between two encodings of equal length.
pub fn face_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
