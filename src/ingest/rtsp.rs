//! RTSP camera source using GStreamer.
//!
//! Pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB). The appsink holds
//! at most `capture_buffer_frames` decoded samples and drops the oldest beyond that.

use anyhow::{anyhow, Context, Result};

use super::{redact_url, InterruptHook, SourceOptions};
use crate::frame::Frame;

pub(crate) struct GstreamerSource {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    read_timeout_ms: u64,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub(crate) fn connect(url: &str, options: &SourceOptions) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let max_buffers = u32::try_from(options.capture_buffer_frames.max(1)).unwrap_or(u32::MAX);
        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers={} drop=true",
            url, max_buffers
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(max_buffers);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("start RTSP pipeline for {}", redact_url(url)))?;

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            read_timeout_ms: options.read_timeout.as_millis().try_into().unwrap_or(u64::MAX),
            last_error: None,
        })
    }

    pub(crate) fn read_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(self.read_timeout_ms))
            .ok_or_else(|| anyhow!("RTSP stream {} stalled or ended", redact_url(&self.url)))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Frame::from_rgb(pixels, width, height)
    }

    /// Stops the pipeline so a blocked `try_pull_sample` returns.
    pub(crate) fn interrupt_hook(&self) -> InterruptHook {
        let pipeline = self.pipeline.clone();
        Box::new(move || {
            let _ = pipeline.set_state(gstreamer::State::Null);
        })
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
