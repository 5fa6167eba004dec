use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::{DispatchSettings, DEFAULT_BATCH_SIZE, DEFAULT_IDLE_BACKOFF};
use crate::frame::{BufferCapacity, OverflowPolicy, ResizePolicy};
use crate::ingest::{SourceOptions, DEFAULT_CAPTURE_BUFFER_FRAMES, DEFAULT_READ_TIMEOUT};
use crate::producer::CameraSpec;
use crate::recognize::{DEFAULT_TOLERANCE, DEFAULT_UPSAMPLE};
use crate::report::{SmtpConfig, SmtpSecurity};
use crate::results::{StoreKind, DEFAULT_REPORT_PATH};
use crate::shutdown::{ShutdownSettings, DEFAULT_JOIN_TIMEOUT};

const DEFAULT_KNOWN_FACES_PATH: &str = "dataset/face_encodings.json";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FacewatchConfigFile {
    cameras: Option<BTreeMap<String, String>>,
    frame: Option<FrameConfigFile>,
    capture: Option<CaptureConfigFile>,
    buffer: Option<BufferConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    results: Option<ResultsConfigFile>,
    email: Option<EmailConfigFile>,
    shutdown: Option<ShutdownConfigFile>,
    logging: Option<LoggingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FrameConfigFile {
    max_width: Option<u32>,
    max_height: Option<u32>,
    target_width: Option<u32>,
    target_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    buffer_frames: Option<usize>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    capacity: Option<usize>,
    overflow: Option<OverflowPolicy>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    batch_size: Option<usize>,
    idle_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    tolerance: Option<f64>,
    upsample: Option<u32>,
    known_faces_path: Option<PathBuf>,
    backend: Option<BackendKind>,
    remote_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ResultsConfigFile {
    store: Option<StoreKind>,
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct EmailConfigFile {
    sender: Option<String>,
    receiver: Option<String>,
    smtp_addr: Option<String>,
    security: Option<SmtpSecurity>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ShutdownConfigFile {
    join_timeout_ms: Option<u64>,
    drain_on_shutdown: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingConfigFile {
    file: Option<PathBuf>,
}

/// Which face backend feeds the recognizer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum BackendKind {
    /// Never finds a face.
    #[default]
    #[serde(rename = "none")]
    NoFaces,
    /// HTTP face service at `recognition.remote_url`.
    #[serde(rename = "remote")]
    Remote,
}

#[derive(Debug, Clone)]
pub struct FacewatchConfig {
    pub cameras: Vec<CameraSpec>,
    pub frame: ResizePolicy,
    pub capture: SourceOptions,
    pub buffer: BufferCapacity,
    pub dispatch: DispatchSettings,
    pub recognition: RecognitionSettings,
    pub results: ResultSettings,
    pub email: Option<EmailSettings>,
    pub shutdown: ShutdownSettings,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionSettings {
    pub known_faces_path: PathBuf,
    pub backend: BackendKind,
    pub remote_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSettings {
    pub store: StoreKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailSettings {
    pub sender: String,
    pub receiver: String,
    pub smtp: SmtpConfig,
}

impl FacewatchConfig {
    /// Load using `FACEWATCH_CONFIG` as the optional file path.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Defaults, then `path` (or `FACEWATCH_CONFIG`), then environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("FACEWATCH_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let config_path = path.map(Path::to_path_buf).or(env_path);
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FacewatchConfigFile) -> Result<Self> {
        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|(name, url)| CameraSpec::new(name, url))
            .collect();

        let frame_file = file.frame.unwrap_or_default();
        let defaults = ResizePolicy::default();
        let frame = ResizePolicy {
            max_width: frame_file.max_width.unwrap_or(defaults.max_width),
            max_height: frame_file.max_height.unwrap_or(defaults.max_height),
            target_width: frame_file.target_width.unwrap_or(defaults.target_width),
            target_height: frame_file.target_height.unwrap_or(defaults.target_height),
        };

        let capture_file = file.capture.unwrap_or_default();
        let capture = SourceOptions {
            capture_buffer_frames: capture_file
                .buffer_frames
                .unwrap_or(DEFAULT_CAPTURE_BUFFER_FRAMES),
            read_timeout: capture_file
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_READ_TIMEOUT),
        };

        let buffer_file = file.buffer.unwrap_or_default();
        let buffer = match buffer_file.capacity {
            Some(max_entries) => BufferCapacity::Bounded {
                max_entries,
                overflow: buffer_file.overflow.unwrap_or_default(),
            },
            None => BufferCapacity::Unbounded,
        };

        let dispatch_file = file.dispatch.unwrap_or_default();
        let recognition_file = file.recognition.unwrap_or_default();
        let dispatch = DispatchSettings {
            batch_size: dispatch_file.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            tolerance: recognition_file.tolerance.unwrap_or(DEFAULT_TOLERANCE),
            upsample: recognition_file.upsample.unwrap_or(DEFAULT_UPSAMPLE),
            idle_backoff: dispatch_file
                .idle_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_IDLE_BACKOFF),
        };
        let recognition = RecognitionSettings {
            known_faces_path: recognition_file
                .known_faces_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KNOWN_FACES_PATH)),
            backend: recognition_file.backend.unwrap_or_default(),
            remote_url: recognition_file.remote_url,
        };

        let results_file = file.results.unwrap_or_default();
        let results = ResultSettings {
            store: results_file.store.unwrap_or_default(),
            path: results_file
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_PATH)),
        };

        let email = file.email.map(email_from_file).transpose()?;

        let shutdown_file = file.shutdown.unwrap_or_default();
        let shutdown = ShutdownSettings {
            join_timeout: shutdown_file
                .join_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_JOIN_TIMEOUT),
            drain_on_shutdown: shutdown_file.drain_on_shutdown.unwrap_or(true),
        };

        Ok(Self {
            cameras,
            frame,
            capture,
            buffer,
            dispatch,
            recognition,
            results,
            email,
            shutdown,
            log_file: file.logging.and_then(|logging| logging.file),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(cameras) = std::env::var("FACEWATCH_CAMERAS") {
            let parsed = parse_cameras(&cameras)?;
            if !parsed.is_empty() {
                self.cameras = parsed;
            }
        }
        if let Ok(batch) = std::env::var("FACEWATCH_BATCH_SIZE") {
            self.dispatch.batch_size = batch
                .trim()
                .parse()
                .map_err(|_| anyhow!("FACEWATCH_BATCH_SIZE must be a positive integer"))?;
        }
        if let Ok(tolerance) = std::env::var("FACEWATCH_TOLERANCE") {
            self.dispatch.tolerance = tolerance
                .trim()
                .parse()
                .map_err(|_| anyhow!("FACEWATCH_TOLERANCE must be a number"))?;
        }
        if let Ok(path) = std::env::var("FACEWATCH_KNOWN_FACES") {
            if !path.trim().is_empty() {
                self.recognition.known_faces_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("FACEWATCH_REPORT_PATH") {
            if !path.trim().is_empty() {
                self.results.path = PathBuf::from(path);
            }
        }
        if let Ok(password) = std::env::var("FACEWATCH_SMTP_PASSWORD") {
            if let Some(email) = self.email.as_mut() {
                if !password.is_empty() {
                    email.smtp.password = Some(password);
                }
            }
        }
        if let Ok(path) = std::env::var("FACEWATCH_LOG_FILE") {
            if !path.trim().is_empty() {
                self.log_file = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(anyhow!(
                "no cameras configured (set cameras in the config file or FACEWATCH_CAMERAS)"
            ));
        }
        let mut names = BTreeSet::new();
        for camera in &self.cameras {
            if camera.name.trim().is_empty() {
                return Err(anyhow!("camera names must not be empty"));
            }
            if camera.url.trim().is_empty() {
                return Err(anyhow!("camera {} has an empty url", camera.name));
            }
            if !names.insert(camera.name.as_str()) {
                return Err(anyhow!("camera {} is configured more than once", camera.name));
            }
        }
        if self.dispatch.batch_size == 0 {
            return Err(anyhow!("dispatch.batch_size must be greater than zero"));
        }
        if !self.dispatch.tolerance.is_finite() || self.dispatch.tolerance <= 0.0 {
            return Err(anyhow!("recognition.tolerance must be a positive number"));
        }
        if self.frame.target_width == 0 || self.frame.target_height == 0 {
            return Err(anyhow!("frame target size must be greater than zero"));
        }
        if self.capture.capture_buffer_frames == 0 {
            return Err(anyhow!("capture.buffer_frames must be greater than zero"));
        }
        if let BufferCapacity::Bounded { max_entries: 0, .. } = self.buffer {
            return Err(anyhow!("buffer.capacity must be greater than zero"));
        }
        if self.recognition.backend == BackendKind::Remote
            && self
                .recognition
                .remote_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
        {
            return Err(anyhow!("recognition.remote_url is required for the remote backend"));
        }
        if let Some(email) = &self.email {
            if email.smtp.security == SmtpSecurity::Plaintext
                && (email.smtp.username.is_some() || email.smtp.password.is_some())
            {
                return Err(anyhow!(
                    "email.username/password require email.security starttls or tls"
                ));
            }
        }
        Ok(())
    }
}

fn email_from_file(file: EmailConfigFile) -> Result<EmailSettings> {
    let sender = file
        .sender
        .ok_or_else(|| anyhow!("email.sender is required when email is configured"))?;
    let receiver = file
        .receiver
        .ok_or_else(|| anyhow!("email.receiver is required when email is configured"))?;
    let smtp_addr = file
        .smtp_addr
        .ok_or_else(|| anyhow!("email.smtp_addr is required when email is configured"))?;
    let mut smtp = SmtpConfig::new(smtp_addr);
    smtp.security = file.security.unwrap_or_default();
    smtp.username = file.username;
    smtp.password = file.password;
    Ok(EmailSettings {
        sender,
        receiver,
        smtp,
    })
}

fn read_config_file(path: &Path) -> Result<FacewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: FacewatchConfigFile = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// `cam1=url,cam2=url`.
fn parse_cameras(value: &str) -> Result<Vec<CameraSpec>> {
    split_csv(value)
        .into_iter()
        .map(|entry| {
            let (name, url) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("FACEWATCH_CAMERAS entry '{}' is not name=url", entry))?;
            Ok(CameraSpec::new(name.trim(), url.trim()))
        })
        .collect()
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_list_keeps_url_query_strings() -> Result<()> {
        let cameras = parse_cameras("front=stub://front?frames=4, back = http://10.0.0.2:4747/video")?;
        assert_eq!(
            cameras,
            vec![
                CameraSpec::new("front", "stub://front?frames=4"),
                CameraSpec::new("back", "http://10.0.0.2:4747/video"),
            ]
        );
        Ok(())
    }

    #[test]
    fn camera_entry_without_url_is_rejected() {
        assert!(parse_cameras("front").is_err());
    }

    #[test]
    fn defaults_match_documented_values() -> Result<()> {
        let cfg = FacewatchConfig::from_file(FacewatchConfigFile::default())?;
        assert_eq!(cfg.dispatch.batch_size, 8);
        assert_eq!(cfg.dispatch.tolerance, 0.4);
        assert_eq!(cfg.dispatch.upsample, 1);
        assert_eq!(cfg.capture.capture_buffer_frames, 256);
        assert_eq!((cfg.frame.target_width, cfg.frame.target_height), (1280, 720));
        assert_eq!(cfg.buffer, BufferCapacity::Unbounded);
        assert_eq!(cfg.results.path, PathBuf::from("reports/inferred_faces.csv"));
        assert_eq!(cfg.results.store, StoreKind::Csv);
        assert_eq!(cfg.recognition.backend, BackendKind::NoFaces);
        assert!(cfg.shutdown.drain_on_shutdown);
        assert!(cfg.email.is_none());
        Ok(())
    }

    #[test]
    fn partial_email_section_is_rejected() {
        let file: FacewatchConfigFile =
            serde_json::from_str(r#"{"email": {"sender": "a@example.com"}}"#).unwrap();
        assert!(FacewatchConfig::from_file(file).is_err());
    }
}
