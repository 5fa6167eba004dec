//! HTTP face service backend.
//!
//! Each frame is posted as a JPEG to `<url>?upsample=<n>`. The service answers
//! with `{"faces": [{"location": [top, right, bottom, left], "encoding": [..]}]}`.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use super::backend::{BoundingBox, DetectedFace, FaceBackend};
use crate::frame::Frame;

const JPEG_QUALITY: u8 = 90;
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct FaceResponse {
    #[serde(default)]
    faces: Vec<RemoteFace>,
}

#[derive(Debug, Deserialize)]
struct RemoteFace {
    location: [u32; 4],
    encoding: Vec<f64>,
}

pub struct RemoteBackend {
    url: String,
    agent: ureq::Agent,
}

impl RemoteBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl FaceBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn detect_faces(&mut self, frame: &Frame, upsample: u32) -> Result<Vec<DetectedFace>> {
        let jpeg = frame.to_jpeg(JPEG_QUALITY)?;
        let response = self
            .agent
            .post(&self.url)
            .query("upsample", &upsample.to_string())
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
            .with_context(|| format!("face service request to {} failed", self.url))?;
        let body = response
            .into_string()
            .context("read face service response")?;
        parse_faces(&body)
    }
}

fn parse_faces(body: &str) -> Result<Vec<DetectedFace>> {
    let response: FaceResponse =
        serde_json::from_str(body).context("face service returned invalid JSON")?;
    response
        .faces
        .into_iter()
        .map(|face| {
            let [top, right, bottom, left] = face.location;
            if face.encoding.is_empty() {
                return Err(anyhow!("face service returned an empty encoding"));
            }
            Ok(DetectedFace {
                location: BoundingBox::new(top, right, bottom, left),
                encoding: face.encoding,
            })
        })
        .collect()
}
