//! Synthetic source (`stub://`) for tests and dry runs.
//!
//! Query parameters:
//! - `frames`: total readable frames, including the validation read (default: endless)
//! - `width`, `height`: frame size (default 640x480)
//! - `interval_ms`: delay before each frame (default 0)

use anyhow::{anyhow, Result};
use std::time::Duration;
use url::Url;

use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

pub(crate) struct SyntheticSource {
    name: String,
    remaining: Option<u64>,
    width: u32,
    height: u32,
    interval: Duration,
    frame_count: u64,
}

impl SyntheticSource {
    pub(crate) fn new(url: &Url) -> Result<Self> {
        let mut source = Self {
            name: url.host_str().unwrap_or("synthetic").to_string(),
            remaining: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            interval: Duration::ZERO,
            frame_count: 0,
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => source.remaining = Some(parse_param(&key, &value)?),
                "width" => source.width = parse_param(&key, &value)?,
                "height" => source.height = parse_param(&key, &value)?,
                "interval_ms" => {
                    source.interval = Duration::from_millis(parse_param(&key, &value)?)
                }
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if source.width == 0 || source.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        log::debug!(
            "synthetic source {}: {}x{}, frames={:?}",
            source.name,
            source.width,
            source.height,
            source.remaining
        );
        Ok(source)
    }

    pub(crate) fn read_frame(&mut self) -> Result<Frame> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(anyhow!("synthetic stream {} ended", self.name));
            }
            *remaining -= 1;
        }
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        self.frame_count += 1;
        Frame::from_rgb(self.generate_pixels(), self.width, self.height)
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.width as usize) * (self.height as usize) * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter '{}' has invalid value '{}'", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_stream_ends_after_frame_budget() -> Result<()> {
        let url = Url::parse("stub://cam?frames=2&width=4&height=2")?;
        let mut source = SyntheticSource::new(&url)?;
        let frame = source.read_frame()?;
        assert_eq!((frame.width, frame.height), (4, 2));
        source.read_frame()?;
        assert!(source.read_frame().is_err());
        Ok(())
    }

    #[test]
    fn rejects_bad_parameters() -> Result<()> {
        assert!(SyntheticSource::new(&Url::parse("stub://cam?frames=many")?).is_err());
        assert!(SyntheticSource::new(&Url::parse("stub://cam?color=red")?).is_err());
        assert!(SyntheticSource::new(&Url::parse("stub://cam?width=0")?).is_err());
        Ok(())
    }
}
