//! Live preview of the camera's MJPEG stream.
//!
//! The `video` endpoint serves `multipart/x-mixed-replace` JPEG parts.  Frames
//! are cut out of the byte stream by their SOI/EOI markers, decoded, stamped
//! with the local wall-clock time and handed to a [`FrameSink`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveTime};
use futures_util::{pin_mut, StreamExt};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::client::CameraClient;
use crate::error::{CamError, Result};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Upper bound on grabbing a single frame for a brightness reading.
const FRAME_TIMEOUT: Duration = Duration::from_secs(15);

/// Drop a partial frame that grows past this without an EOI marker.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

// Overlay placement: baseline-left corner, glyph scale, colour.
const TEXT_X:      i32 = 50;
const TEXT_Y:      i32 = 120;
const TEXT_SCALE:  u32 = 4;
const TEXT_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);

// ── MJPEG splitting ───────────────────────────────────────────────────────────

/// Incremental JPEG extractor for an MJPEG byte stream.
///
/// A frame ends at its first EOI marker, so frames must not embed a JPEG
/// thumbnail (EXIF).  IP Webcam frames carry none.
#[derive(Debug, Default)]
pub struct MjpegSplitter {
    buf:      Vec<u8>,
    in_frame: bool,
    /// Offset up to which `buf` has been searched for EOI.
    scanned:  usize,
}

impl MjpegSplitter {
    /// Feed a chunk; returns every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.in_frame {
                match find(&self.buf, SOI) {
                    Some(start) => {
                        self.buf.drain(..start);
                        self.in_frame = true;
                        self.scanned = SOI.len();
                    }
                    None => {
                        // A trailing 0xFF may be the first half of the next SOI.
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        let skip = self.buf.len() - keep;
                        self.buf.drain(..skip);
                        break;
                    }
                }
            }

            match find(&self.buf[self.scanned..], EOI) {
                Some(off) => {
                    let end = self.scanned + off + EOI.len();
                    frames.push(self.buf.drain(..end).collect());
                    self.in_frame = false;
                }
                None => {
                    if self.buf.len() > MAX_FRAME_BYTES {
                        warn!("dropping {} bytes of unterminated JPEG data", self.buf.len());
                        self.buf.clear();
                        self.in_frame = false;
                    } else {
                        self.scanned = self.buf.len().saturating_sub(1).max(SOI.len());
                    }
                    break;
                }
            }
        }
        frames
    }
}

fn find(hay: &[u8], marker: [u8; 2]) -> Option<usize> {
    hay.windows(2).position(|w| w == &marker[..])
}

fn decode_jpeg(data: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8())
}

// ── Timestamp overlay ─────────────────────────────────────────────────────────

/// 5×7 glyphs, one byte per row, bit 4 is the leftmost column.
fn glyph(c: char) -> Option<[u8; 7]> {
    Some(match c {
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        _ => return None,
    })
}

fn draw_text(img: &mut RgbImage, text: &str, x: i32, baseline: i32, scale: u32, colour: Rgb<u8>) {
    let px = scale as i32;
    let top = baseline - 7 * px;
    for (i, c) in text.chars().enumerate() {
        let Some(rows) = glyph(c) else { continue };
        let left = x + i as i32 * 6 * px;
        for (r, bits) in rows.iter().enumerate() {
            for col in 0..5 {
                if bits & (0b10000 >> col) != 0 {
                    let rect = Rect::at(left + col * px, top + r as i32 * px).of_size(scale, scale);
                    draw_filled_rect_mut(img, rect, colour);
                }
            }
        }
    }
}

/// Stamp `HH:MM:SS.mmm` onto the frame.
pub fn overlay_timestamp(frame: &mut RgbImage, time: NaiveTime) {
    let text = time.format("%H:%M:%S%.3f").to_string();
    draw_text(frame, &text, TEXT_X, TEXT_Y, TEXT_SCALE, TEXT_COLOUR);
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// Destination for annotated preview frames.
pub trait FrameSink {
    fn show(&mut self, frame: &RgbImage) -> Result<()>;

    /// Release display resources.  Called once when the preview ends.
    fn close(&mut self) {}
}

/// Keeps the most recent frame in a JPEG file, replaced atomically.
pub struct JpegFileSink {
    path: PathBuf,
    tmp:  PathBuf,
}

impl JpegFileSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".part");
        Ok(Self { path: path.to_path_buf(), tmp: PathBuf::from(tmp) })
    }
}

impl FrameSink for JpegFileSink {
    fn show(&mut self, frame: &RgbImage) -> Result<()> {
        frame.save_with_format(&self.tmp, ImageFormat::Jpeg)?;
        fs::rename(&self.tmp, &self.path)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.tmp.exists() {
            if let Err(e) = fs::remove_file(&self.tmp) {
                warn!("cannot remove {}: {e}", self.tmp.display());
            }
        }
        info!("preview closed; last frame in {}", self.path.display());
    }
}

/// Closes the sink on every exit path of the preview loop.
struct SinkGuard<'a, S: FrameSink + ?Sized>(&'a mut S);

impl<S: FrameSink + ?Sized> Drop for SinkGuard<'_, S> {
    fn drop(&mut self) {
        self.0.close();
    }
}

// ── Client operations ─────────────────────────────────────────────────────────

impl CameraClient {
    /// Stream the live video into `sink` until `cancel` fires or the stream
    /// ends.  Returns the number of frames shown.
    pub async fn stream_preview<S: FrameSink + ?Sized>(
        &self,
        sink:   &mut S,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let resp = self.open_video(None).await?;
        let guard = SinkGuard(sink);
        let body = resp.bytes_stream();
        pin_mut!(body);
        let mut splitter = MjpegSplitter::default();
        let mut shown = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("preview cancelled");
                    break;
                }
                chunk = body.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    warn!("couldn't read frame from camera: {e}");
                    break;
                }
                None => {
                    info!("video stream ended");
                    break;
                }
            };

            for jpeg in splitter.push(&chunk) {
                let mut frame = match decode_jpeg(&jpeg) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("skipping undecodable frame: {e}");
                        continue;
                    }
                };
                overlay_timestamp(&mut frame, Local::now().time());
                guard.0.show(&frame)?;
                shown += 1;
            }
        }

        info!("preview showed {shown} frames");
        Ok(shown)
    }

    /// Mean HSV value (brightness) of one video frame, 0‥255.
    pub async fn brightness(&self) -> Result<f64> {
        let resp = self.open_video(Some(FRAME_TIMEOUT)).await?;
        let body = resp.bytes_stream();
        pin_mut!(body);
        let mut splitter = MjpegSplitter::default();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if let Some(jpeg) = splitter.push(&chunk).into_iter().next() {
                let value = mean_value_channel(&decode_jpeg(&jpeg)?);
                debug!("frame brightness {value:.1}");
                return Ok(value);
            }
        }
        Err(CamError::Connection("video stream ended before a full frame arrived".into()))
    }
}

/// Mean of `max(r, g, b)` over all pixels.
pub fn mean_value_channel(frame: &RgbImage) -> f64 {
    let count = u64::from(frame.width()) * u64::from(frame.height());
    if count == 0 {
        return 0.0;
    }
    let sum: u64 = frame
        .pixels()
        .map(|Rgb([r, g, b])| u64::from(*r.max(g).max(b)))
        .sum();
    sum as f64 / count as f64
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::*;
    use crate::client::tests::setup;

    fn jpeg(colour: [u8; 3], w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(w, h, Rgb(colour));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    fn multipart(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        for f in frames {
            body.extend_from_slice(
                format!("--Ba4oTvQMY8ew04N8dcnM\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", f.len())
                    .as_bytes(),
            );
            body.extend_from_slice(f);
            body.extend_from_slice(b"\r\n");
        }
        body
    }

    #[derive(Default)]
    struct Collect {
        sizes:  Vec<(u32, u32)>,
        closed: bool,
    }

    impl FrameSink for Collect {
        fn show(&mut self, frame: &RgbImage) -> Result<()> {
            self.sizes.push(frame.dimensions());
            Ok(())
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn splitter_handles_arbitrary_chunking() {
        let a = [0xFF, 0xD8, 1, 2, 0xFF, 0x00, 3, 0xFF, 0xD9];
        let b = [0xFF, 0xD8, 9, 0xFF, 0xD9];
        let mut stream = b"--boundary\r\n\r\n".to_vec();
        stream.extend_from_slice(&a);
        stream.extend_from_slice(b"\r\n--boundary\r\n\r\n");
        stream.extend_from_slice(&b);

        for chunk_len in [1, 2, 3, 7, stream.len()] {
            let mut splitter = MjpegSplitter::default();
            let frames: Vec<Vec<u8>> = stream.chunks(chunk_len).flat_map(|c| splitter.push(c)).collect();
            assert_eq!(frames, [a.to_vec(), b.to_vec()], "chunk_len={chunk_len}");
        }
    }

    #[test]
    fn splitter_holds_partial_frame() {
        let mut splitter = MjpegSplitter::default();
        assert!(splitter.push(&[0xFF, 0xD8, 5, 6]).is_empty());
        assert_eq!(splitter.push(&[7, 0xFF, 0xD9, 0xAA]), [vec![0xFF, 0xD8, 5, 6, 7, 0xFF, 0xD9]]);
    }

    #[test]
    fn splitter_cuts_nested_jpeg_at_first_eoi() {
        let mut splitter = MjpegSplitter::default();
        let frames = splitter.push(&[0xFF, 0xD8, 1, 0xFF, 0xD8, 2, 0xFF, 0xD9, 3, 0xFF, 0xD9]);
        assert_eq!(frames, [vec![0xFF, 0xD8, 1, 0xFF, 0xD8, 2, 0xFF, 0xD9]]);
        // The outer tail has no SOI and is discarded.
        assert!(splitter.push(&[0xFF, 0xD8, 9]).is_empty());
        assert_eq!(splitter.push(&[0xFF, 0xD9]), [vec![0xFF, 0xD8, 9, 0xFF, 0xD9]]);
    }

    #[test]
    fn overlay_draws_green_digits() {
        let mut frame = RgbImage::new(640, 160);
        let t = NaiveTime::from_hms_milli_opt(12, 34, 56, 789).unwrap();
        overlay_timestamp(&mut frame, t);

        // Top row of '1' lights only its middle column.
        let top = (TEXT_Y - 7 * TEXT_SCALE as i32) as u32;
        assert_eq!(*frame.get_pixel(TEXT_X as u32 + 2 * TEXT_SCALE, top), TEXT_COLOUR);
        assert_eq!(*frame.get_pixel(TEXT_X as u32, top), Rgb([0, 0, 0]));
    }

    #[test]
    fn overlay_clips_on_small_frames() {
        let mut frame = RgbImage::new(16, 16);
        overlay_timestamp(&mut frame, NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn value_channel_is_max_component() {
        let frame = RgbImage::from_pixel(4, 4, Rgb([10, 200, 30]));
        assert_eq!(mean_value_channel(&frame), 200.0);
        assert_eq!(mean_value_channel(&RgbImage::new(0, 0)), 0.0);
    }

    #[test]
    fn file_sink_replaces_frame_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("live").join("preview.jpg");
        let mut sink = JpegFileSink::create(&target).unwrap();

        sink.show(&RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]))).unwrap();
        sink.show(&RgbImage::from_pixel(16, 8, Rgb([0, 0, 255]))).unwrap();
        sink.close();

        let saved = image::open(&target).unwrap();
        assert_eq!((saved.width(), saved.height()), (16, 8));
        assert!(!dir.path().join("live").join("preview.jpg.part").exists());
    }

    #[tokio::test]
    async fn preview_shows_every_frame_and_closes_sink() {
        let (server, client) = setup().await;
        let body = multipart(&[jpeg([0, 0, 0], 320, 240), jpeg([255, 255, 255], 320, 240)]);
        Mock::given(method("GET"))
            .and(path("/video"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(body)
                    .insert_header("content-type", "multipart/x-mixed-replace;boundary=Ba4oTvQMY8ew04N8dcnM"),
            )
            .mount(&server)
            .await;

        let mut sink = Collect::default();
        let shown = client.stream_preview(&mut sink, &CancellationToken::new()).await.unwrap();

        assert_eq!(shown, 2);
        assert_eq!(sink.sizes, [(320, 240), (320, 240)]);
        assert!(sink.closed);
    }

    #[tokio::test]
    async fn cancelled_preview_still_closes_sink() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/video"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(multipart(&[jpeg([9, 9, 9], 8, 8)])))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = Collect::default();
        assert_eq!(client.stream_preview(&mut sink, &cancel).await.unwrap(), 0);
        assert!(sink.closed);
    }

    #[tokio::test]
    async fn missing_video_endpoint_is_connection_error() {
        let (_server, client) = setup().await;
        let mut sink = Collect::default();
        let err = client.stream_preview(&mut sink, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CamError::Connection(_)), "{err}");
        assert!(!sink.closed);
    }

    #[tokio::test]
    async fn brightness_of_solid_frame() {
        let (server, client) = setup().await;
        Mock::given(method("GET"))
            .and(path("/video"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(multipart(&[jpeg([40, 180, 90], 64, 64)])))
            .mount(&server)
            .await;

        let value = client.brightness().await.unwrap();
        assert!((value - 180.0).abs() < 4.0, "brightness {value}");
    }
}
