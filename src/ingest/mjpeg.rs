//! HTTP camera source.
//!
//! IP webcams typically serve MJPEG as `multipart/x-mixed-replace`. When the
//! endpoint answers with a single image instead, each read fetches a fresh snapshot.
//!
//! An MJPEG stream is pulled off the socket by a reader thread as fast as the
//! camera sends it. Parts are split on `Content-Length` when the camera sends one,
//! otherwise on the multipart boundary. Complete JPEGs wait in a queue capped at
//! `capture_buffer_frames`; when the consumer falls behind, the oldest is dropped,
//! so a read never returns a frame older than the queue depth.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use super::{redact_url, InterruptHook, SourceOptions};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const MAX_HEADER_BYTES: usize = 8 * 1024;
const READ_CHUNK_BYTES: usize = 8192;

pub(crate) struct HttpSource {
    url: String,
    agent: ureq::Agent,
    stream: HttpStream,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl HttpSource {
    pub(crate) fn connect(url: &str, options: &SourceOptions) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(options.read_timeout)
            .timeout_read(options.read_timeout)
            .build();
        let response = agent
            .get(url)
            .call()
            .with_context(|| format!("connect to http camera {}", redact_url(url)))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_string();
        let stream = if content_type.to_lowercase().contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::spawn(
                response.into_reader(),
                multipart_boundary(&content_type),
                options.capture_buffer_frames,
            )?)
        } else {
            HttpStream::Snapshot
        };
        Ok(Self {
            url: url.to_string(),
            agent,
            stream,
        })
    }

    pub(crate) fn read_frame(&mut self) -> Result<Frame> {
        let jpeg = match &mut self.stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::Snapshot => fetch_snapshot(&self.agent, &self.url)?,
        };
        decode_jpeg(&jpeg)
    }

    /// Wakes a read blocked on the MJPEG queue. Snapshot reads end on the read timeout.
    pub(crate) fn interrupt_hook(&self) -> Option<InterruptHook> {
        match &self.stream {
            HttpStream::Mjpeg(stream) => {
                let queue = stream.queue.clone();
                let hook: InterruptHook = Box::new(move || queue.close());
                Some(hook)
            }
            HttpStream::Snapshot => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Read-ahead queue
// ----------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    frames: VecDeque<Vec<u8>>,
    ended: Option<String>,
    closed: bool,
    dropped: u64,
}

struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    max_pending: usize,
}

impl FrameQueue {
    fn new(max_pending: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            max_pending: max_pending.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false once the consumer has gone away.
    fn push(&self, jpeg: Vec<u8>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        if state.frames.len() >= self.max_pending {
            state.frames.pop_front();
            state.dropped += 1;
            if state.dropped % 100 == 1 {
                log::warn!(
                    "mjpeg read-ahead full ({} frames); dropped {} so far",
                    self.max_pending,
                    state.dropped
                );
            }
        }
        state.frames.push_back(jpeg);
        self.ready.notify_one();
        true
    }

    fn finish(&self, reason: String) {
        let mut state = self.lock();
        if state.ended.is_none() {
            state.ended = Some(reason);
        }
        self.ready.notify_all();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    /// Oldest queued JPEG. Queued frames are still handed out after the stream ends.
    fn next(&self) -> Result<Vec<u8>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(anyhow!("mjpeg stream closed"));
            }
            if let Some(jpeg) = state.frames.pop_front() {
                return Ok(jpeg);
            }
            if let Some(reason) = &state.ended {
                return Err(anyhow!("{}", reason));
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

pub(crate) struct MjpegStream {
    queue: Arc<FrameQueue>,
}

impl MjpegStream {
    pub(crate) fn spawn(
        reader: Box<dyn Read + Send>,
        boundary: Option<String>,
        max_pending: usize,
    ) -> Result<Self> {
        let queue = Arc::new(FrameQueue::new(max_pending));
        let producer = queue.clone();
        std::thread::Builder::new()
            .name("mjpeg-reader".to_string())
            .spawn(move || read_parts(reader, PartSplitter::new(boundary), &producer))
            .context("spawn mjpeg reader thread")?;
        Ok(Self { queue })
    }

    pub(crate) fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        self.queue.next()
    }
}

impl Drop for MjpegStream {
    fn drop(&mut self) {
        self.queue.close();
    }
}

fn read_parts(mut reader: Box<dyn Read + Send>, mut splitter: PartSplitter, queue: &FrameQueue) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => return queue.finish("mjpeg stream ended".to_string()),
            Ok(read) => read,
            Err(err) => return queue.finish(format!("read mjpeg chunk: {}", err)),
        };
        splitter.extend(&chunk[..read]);
        loop {
            match splitter.next_part() {
                Ok(Some(jpeg)) => {
                    if !queue.push(jpeg) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => return queue.finish(format!("{:#}", err)),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Multipart parsing
// ----------------------------------------------------------------------------

/// `boundary` parameter of a multipart Content-Type, without leading dashes.
fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"').trim_start_matches('-');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Splits a multipart body into part payloads.
struct PartSplitter {
    buffer: Vec<u8>,
    /// `--` followed by the boundary, or just `--` when the camera didn't send one.
    delimiter: Vec<u8>,
}

impl PartSplitter {
    fn new(boundary: Option<String>) -> Self {
        let mut delimiter = b"--".to_vec();
        if let Some(boundary) = boundary {
            delimiter.extend_from_slice(boundary.as_bytes());
        }
        Self {
            buffer: Vec::with_capacity(64 * 1024),
            delimiter,
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete part payload, or `None` until more bytes arrive.
    fn next_part(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(start) = find(&self.buffer, &self.delimiter) else {
            // Keep a tail in case the delimiter straddles two chunks.
            let keep = self.delimiter.len().min(self.buffer.len());
            self.buffer.drain(..self.buffer.len() - keep);
            return Ok(None);
        };
        self.buffer.drain(..start);

        let Some(header_len) = find(&self.buffer, b"\r\n\r\n") else {
            if self.buffer.len() > MAX_HEADER_BYTES {
                return Err(anyhow!("mjpeg part headers exceed {} bytes", MAX_HEADER_BYTES));
            }
            return Ok(None);
        };
        let body_start = header_len + 4;
        let headers = String::from_utf8_lossy(&self.buffer[..header_len]).into_owned();

        if let Some(length) = content_length(&headers)? {
            if length > MAX_JPEG_BYTES {
                return Err(anyhow!("mjpeg part of {} bytes exceeds limit", length));
            }
            if self.buffer.len() < body_start + length {
                return Ok(None);
            }
            let body = self.buffer[body_start..body_start + length].to_vec();
            self.buffer.drain(..body_start + length);
            return Ok(Some(body));
        }

        let Some(body_len) = find(&self.buffer[body_start..], &self.delimiter) else {
            if self.buffer.len() > body_start + MAX_JPEG_BYTES {
                return Err(anyhow!("mjpeg part exceeds {} bytes", MAX_JPEG_BYTES));
            }
            return Ok(None);
        };
        let body_end = body_start + body_len;
        let body = trim_part_end(&self.buffer[body_start..body_end]).to_vec();
        self.buffer.drain(..body_end);
        Ok(Some(body))
    }
}

fn content_length(headers: &str) -> Result<Option<usize>> {
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let length = value
                    .trim()
                    .parse()
                    .map_err(|_| anyhow!("invalid mjpeg Content-Length '{}'", value.trim()))?;
                return Ok(Some(length));
            }
        }
    }
    Ok(None)
}

/// Drop the CRLF (and any extra dashes) that precede the next delimiter.
fn trim_part_end(body: &[u8]) -> &[u8] {
    let end = body
        .iter()
        .rposition(|b| !matches!(b, b'\r' | b'\n' | b'-'))
        .map_or(0, |i| i + 1);
    &body[..end]
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", redact_url(url)))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Frame::from_rgb(image.into_rgb8().into_raw(), width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn fake_jpeg(marker: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, marker, marker, 0xFF, 0xD9]
    }

    /// A JPEG whose EXIF thumbnail carries its own end-of-image marker.
    fn jpeg_with_thumbnail() -> Vec<u8> {
        vec![
            0xFF, 0xD8, 0xFF, 0xE1, 0xFF, 0xD8, 0x01, 0xFF, 0xD9, 0x02, 0x03, 0xFF, 0xD9,
        ]
    }

    fn multipart(parts: &[Vec<u8>], with_length: bool) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n");
            if with_length {
                body.extend_from_slice(format!("Content-Length: {}\r\n", part.len()).as_bytes());
            }
            body.extend_from_slice(b"\r\n");
            body.extend_from_slice(part);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"--frame--\r\n");
        body
    }

    fn split_all(body: &[u8], boundary: Option<&str>, chunk: usize) -> Result<Vec<Vec<u8>>> {
        let mut splitter = PartSplitter::new(boundary.map(str::to_string));
        let mut parts = Vec::new();
        for bytes in body.chunks(chunk) {
            splitter.extend(bytes);
            while let Some(part) = splitter.next_part()? {
                parts.push(part);
            }
        }
        Ok(parts)
    }

    #[test]
    fn splits_on_boundary_and_content_length() -> Result<()> {
        let frames = vec![fake_jpeg(1), jpeg_with_thumbnail(), fake_jpeg(3)];
        for with_length in [false, true] {
            let body = multipart(&frames, with_length);
            for chunk in [3, 7, body.len()] {
                assert_eq!(split_all(&body, Some("frame"), chunk)?, frames);
            }
        }
        Ok(())
    }

    #[test]
    fn embedded_end_marker_does_not_cut_the_frame() -> Result<()> {
        let body = multipart(&[jpeg_with_thumbnail()], false);
        let parts = split_all(&body, None, body.len())?;
        assert_eq!(parts, vec![jpeg_with_thumbnail()]);
        Ok(())
    }

    #[test]
    fn boundary_is_read_from_content_type() {
        assert_eq!(
            multipart_boundary("multipart/x-mixed-replace; boundary=frame"),
            Some("frame".to_string())
        );
        assert_eq!(
            multipart_boundary("multipart/x-mixed-replace;boundary=\"--myboundary\""),
            Some("myboundary".to_string())
        );
        assert_eq!(multipart_boundary("multipart/x-mixed-replace"), None);
    }

    #[test]
    fn oversized_content_length_is_an_error() {
        let mut splitter = PartSplitter::new(Some("frame".to_string()));
        splitter.extend(b"--frame\r\nContent-Length: 99999999\r\n\r\n");
        assert!(splitter.next_part().is_err());
    }

    #[test]
    fn stream_hands_out_frames_then_ends() -> Result<()> {
        let body = multipart(&[fake_jpeg(1), fake_jpeg(2)], true);
        let mut stream = MjpegStream::spawn(Box::new(Cursor::new(body)), Some("frame".into()), 8)?;
        assert_eq!(stream.read_next_jpeg()?, fake_jpeg(1));
        assert_eq!(stream.read_next_jpeg()?, fake_jpeg(2));
        assert!(stream.read_next_jpeg().is_err());
        Ok(())
    }

    #[test]
    fn read_ahead_keeps_only_the_newest_frames() -> Result<()> {
        let queue = FrameQueue::new(2);
        for marker in 1..=5 {
            assert!(queue.push(fake_jpeg(marker)));
        }
        queue.finish("done".to_string());
        assert_eq!(queue.next()?, fake_jpeg(4));
        assert_eq!(queue.next()?, fake_jpeg(5));
        assert!(queue.next().is_err());
        assert_eq!(queue.dropped(), 3);
        Ok(())
    }

    #[test]
    fn close_wakes_a_blocked_reader() {
        let queue = Arc::new(FrameQueue::new(4));
        let closer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            closer.close();
        });
        assert!(queue.next().is_err());
        assert!(!queue.push(fake_jpeg(1)));
        handle.join().unwrap();
    }

    #[test]
    fn decodes_real_jpeg() -> Result<()> {
        let frame = Frame::from_rgb(vec![128u8; 8 * 8 * 3], 8, 8)?;
        let decoded = decode_jpeg(&frame.to_jpeg(90)?)?;
        assert_eq!((decoded.width, decoded.height), (8, 8));
        Ok(())
    }
}
