//! Top-level wiring: producers feed the shared buffer, the dispatcher consumes it on
//! the calling thread, and the shutdown coordinator finishes the run.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

use crate::config::{BackendKind, EmailSettings, FacewatchConfig, RecognitionSettings, ResultSettings};
use crate::dispatch::BatchDispatcher;
use crate::frame::FrameBuffer;
use crate::producer::{ProducerContext, ProducerRoster};
use crate::recognize::{
    FaceBackend, FaceRecognizer, KnownFaceSet, NoFaceBackend, Recognizer, RemoteBackend,
    DEFAULT_REMOTE_TIMEOUT,
};
use crate::report::SmtpMailer;
use crate::results::{open_store, ResultStore};
use crate::shutdown::{ReportDelivery, ShutdownCoordinator, ShutdownReport, ShutdownSignal};

pub struct Pipeline {
    config: FacewatchConfig,
    known: Arc<KnownFaceSet>,
    signal: ShutdownSignal,
    buffer: Arc<FrameBuffer>,
}

impl Pipeline {
    pub fn new(config: FacewatchConfig, known: KnownFaceSet) -> Self {
        let buffer = Arc::new(FrameBuffer::new(config.buffer));
        Self::with_buffer(config, known, buffer)
    }

    /// Use a caller-supplied buffer instead of one built from `config.buffer`.
    pub fn with_buffer(config: FacewatchConfig, known: KnownFaceSet, buffer: Arc<FrameBuffer>) -> Self {
        Self {
            config,
            known: Arc::new(known),
            signal: ShutdownSignal::new(),
            buffer,
        }
    }

    /// Load the known-face set named by the config. A missing or invalid file is fatal.
    pub fn from_config(config: FacewatchConfig) -> Result<Self> {
        let path = config.recognition.known_faces_path.clone();
        let known = KnownFaceSet::load(&path)?;
        log::info!(
            "loaded {} known encodings ({} people) from {}",
            known.len(),
            known.names().len(),
            path.display()
        );
        Ok(Self::new(config, known))
    }

    pub fn config(&self) -> &FacewatchConfig {
        &self.config
    }

    pub fn known_faces(&self) -> &KnownFaceSet {
        &self.known
    }

    /// Handle for interrupt handlers. Raising it starts the shutdown sequence.
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        self.buffer.clone()
    }

    /// Run with collaborators built from the config.
    pub fn run_configured(self) -> Result<ShutdownReport> {
        let mut recognizer = Recognizer::new(build_backend(&self.config.recognition)?);
        recognizer.warm_up().context("face backend warm-up failed")?;
        log::info!("face backend: {}", recognizer.backend_name());
        let store = build_store(&self.config.results);
        let delivery = build_delivery(self.config.email.as_ref());
        Ok(self.run(recognizer, store, delivery))
    }

    /// Start every camera, dispatch until stopped or every camera is gone, then
    /// shut down.
    pub fn run<R: FaceRecognizer>(
        self,
        recognizer: R,
        store: Box<dyn ResultStore>,
        delivery: Option<ReportDelivery>,
    ) -> ShutdownReport {
        let ctx = ProducerContext {
            buffer: self.buffer.clone(),
            signal: self.signal.clone(),
            resize: self.config.frame,
            source_options: self.config.capture.clone(),
        };
        let mut roster = ProducerRoster::new(ctx);
        for camera in &self.config.cameras {
            let name = camera.name.clone();
            if let Err(err) = roster.spawn(camera.clone()) {
                log::error!("camera {} not started: {:#}", name, err);
            }
        }

        let mut dispatcher = BatchDispatcher::new(
            self.buffer.clone(),
            recognizer,
            self.known.clone(),
            self.config.dispatch.clone(),
        );
        log::info!(
            "dispatching from {} cameras (batch size {}, tolerance {})",
            self.config.cameras.len(),
            self.config.dispatch.batch_size,
            self.config.dispatch.tolerance
        );

        let signal = self.signal.clone();
        dispatcher.run_until(|| !signal.is_raised() && roster.poll() > 0);

        if signal.is_raised() {
            log::info!("stop requested");
        } else {
            log::info!("all camera streams have ended");
        }
        for (camera, reason) in roster.connect_failures() {
            log::warn!("camera {} never connected: {}", camera, reason);
        }

        ShutdownCoordinator::new(
            self.signal,
            self.buffer,
            store,
            delivery,
            self.config.shutdown.clone(),
        )
        .shutdown(roster, dispatcher)
    }
}

pub fn build_backend(settings: &RecognitionSettings) -> Result<Box<dyn FaceBackend>> {
    match settings.backend {
        BackendKind::NoFaces => Ok(Box::new(NoFaceBackend)),
        BackendKind::Remote => {
            let url = settings
                .remote_url
                .as_deref()
                .ok_or_else(|| anyhow!("remote backend needs recognition.remote_url"))?;
            Ok(Box::new(RemoteBackend::new(url, DEFAULT_REMOTE_TIMEOUT)))
        }
    }
}

pub fn build_store(settings: &ResultSettings) -> Box<dyn ResultStore> {
    open_store(settings.store, &settings.path)
}

pub fn build_delivery(settings: Option<&EmailSettings>) -> Option<ReportDelivery> {
    settings.map(|email| ReportDelivery {
        mailer: Box::new(SmtpMailer::new(email.smtp.clone())),
        sender: email.sender.clone(),
        receiver: email.receiver.clone(),
    })
}
