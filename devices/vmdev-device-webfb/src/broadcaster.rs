/*
 *  vmdev web framebuffer plugin - pixel buffers, encode timer, framing
 */

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use log::{debug, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Encode cadence.
pub(crate) const FB_FPS: u64 = 30;

/// Latency over size: moderate quality, whatever the encoder can do fast.
pub(crate) const JPEG_QUALITY: u8 = 75;

pub(crate) const BYTES_PER_PIXEL: usize = 4;

/// Guest-visible pixel memory. The VM maps this region directly, so the
/// guest writes bytes into it at arbitrary times and widths with no lock;
/// the snapshot copy races those writes on purpose. A torn frame shows a
/// few stale pixels for one tick and nothing else — every frame is still
/// a structurally complete image.
pub(crate) struct PixelBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the buffer is raw shared memory by design; all access goes
// through raw pointers and byte copies that tolerate racing writes.
unsafe impl Send for PixelBuffer {}
unsafe impl Sync for PixelBuffer {}

impl PixelBuffer {
    pub fn zeroed(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        // SAFETY: a freshly allocated box is never null.
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(boxed) as *mut u8) };
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Copy the live pixels into `dst`. Guest writes may land mid-copy;
    /// that is the accepted tearing artifact.
    pub fn snapshot_into(&self, dst: &mut [u8]) {
        let count = self.len.min(dst.len());
        // SAFETY: source stays allocated for our lifetime, dst is ours,
        // and the ranges cannot overlap.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.as_ptr(), dst.as_mut_ptr(), count) };
    }

    /// Write into the live buffer the way the guest would (tests and
    /// host-side blits).
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        if offset >= self.len {
            return;
        }
        let count = bytes.len().min(self.len - offset);
        // SAFETY: bounds clamped above.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), count) };
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from the boxed slice in `zeroed`.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len)));
        }
    }
}

/// Compress one a8r8g8b8 snapshot (little-endian, so B,G,R,A in memory)
/// to JPEG. `rgb` is the caller's scratch buffer, reused across ticks.
pub(crate) fn encode_bgra_jpeg(
    snapshot: &[u8],
    width: u32,
    height: u32,
    rgb: &mut Vec<u8>,
    out: &mut Vec<u8>,
) -> image::ImageResult<()> {
    rgb.clear();
    rgb.reserve(snapshot.len() / BYTES_PER_PIXEL * 3);
    for pixel in snapshot.chunks_exact(BYTES_PER_PIXEL) {
        rgb.push(pixel[2]);
        rgb.push(pixel[1]);
        rgb.push(pixel[0]);
    }

    out.clear();
    let mut encoder = JpegEncoder::new_with_quality(&mut *out, JPEG_QUALITY);
    encoder.encode(rgb, width, height, ExtendedColorType::Rgb8)
}

/// One boundary-delimited part of the `multipart/x-mixed-replace` stream.
/// Built as a single buffer so a viewer connection writes it in one piece
/// and parts can never interleave.
pub(crate) fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// The encode timer: snapshot, compress, atomically replace the current
/// frame. A failed tick keeps the previous frame current and does not
/// disturb future ticks.
pub(crate) async fn encode_loop(
    live: Arc<PixelBuffer>,
    width: u32,
    height: u32,
    frame_tx: watch::Sender<Bytes>,
    mut closing: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(1000 / FB_FPS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut snapshot = vec![0u8; live.len()];
    let mut rgb = Vec::new();
    let mut jpeg = Vec::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                live.snapshot_into(&mut snapshot);
                match encode_bgra_jpeg(&snapshot, width, height, &mut rgb, &mut jpeg) {
                    Ok(()) => {
                        // Whole-frame replacement: viewers observe the old
                        // frame or this one, never a mix.
                        frame_tx.send_replace(Bytes::copy_from_slice(&jpeg));
                    }
                    Err(err) => warn!("frame encode failed, tick skipped: {}", err),
                }
            }
            changed = closing.changed() => {
                if changed.is_err() || *closing.borrow() {
                    break;
                }
            }
        }
    }
    debug!("encode timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_bgra(width: usize, height: usize, b: u8, g: u8, r: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(width * height * BYTES_PER_PIXEL);
        for _ in 0..width * height {
            buf.extend_from_slice(&[b, g, r, 0xFF]);
        }
        buf
    }

    #[test]
    fn encoded_frame_decodes_back_within_quality_loss() {
        let (w, h) = (64u32, 32u32);
        // Per row: left half blue, right half red.
        let mut pixels = Vec::new();
        for _ in 0..h {
            for _ in 0..w / 2 {
                pixels.extend_from_slice(&[0xFF, 0x00, 0x00, 0xFF]);
            }
            for _ in 0..w / 2 {
                pixels.extend_from_slice(&[0x00, 0x00, 0xFF, 0xFF]);
            }
        }

        let mut rgb = Vec::new();
        let mut jpeg = Vec::new();
        encode_bgra_jpeg(&pixels, w, h, &mut rgb, &mut jpeg).unwrap();
        assert!(!jpeg.is_empty());

        let decoded = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (w, h));

        // Sample away from the color edge; JPEG smears the boundary.
        let left = decoded.get_pixel(8, 16);
        let right = decoded.get_pixel(56, 16);
        assert!(left[2] > 200 && left[0] < 60, "left half should decode blue: {:?}", left);
        assert!(right[0] > 200 && right[2] < 60, "right half should decode red: {:?}", right);
    }

    #[test]
    fn encode_rejects_truncated_pixel_data() {
        // Half the pixels missing: the encoder must fail, not emit a
        // frame built from garbage.
        let pixels = solid_bgra(8, 4, 0, 0, 0);
        let mut rgb = Vec::new();
        let mut jpeg = Vec::new();
        assert!(encode_bgra_jpeg(&pixels, 8, 8, &mut rgb, &mut jpeg).is_err());
    }

    #[test]
    fn multipart_part_is_one_self_delimiting_buffer() {
        let payload = b"NOTREALLYAJPEG";
        let part = multipart_part(payload);
        let text = String::from_utf8_lossy(&part);

        assert!(text.starts_with("--frame\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n\r\n", payload.len())));
        assert!(part.ends_with(b"\r\n"));

        // Two parts back to back still parse at their boundaries.
        let twice = [part.clone(), part.clone()].concat();
        let second = &twice[part.len()..];
        assert!(second.starts_with(b"--frame\r\n"));
    }

    #[test]
    fn snapshot_sees_guest_writes() {
        let buf = PixelBuffer::zeroed(16);
        buf.write_bytes(4, &[1, 2, 3, 4]);

        let mut snap = vec![0u8; 16];
        buf.snapshot_into(&mut snap);
        assert_eq!(&snap[4..8], &[1, 2, 3, 4]);
        assert!(snap[..4].iter().all(|&b| b == 0));

        // Out-of-range writes are clamped, not UB and not wrapped.
        buf.write_bytes(14, &[9, 9, 9, 9]);
        buf.snapshot_into(&mut snap);
        assert_eq!(&snap[14..], &[9, 9]);
    }

    #[tokio::test]
    async fn slow_viewers_miss_frames_instead_of_queueing_them() {
        let (tx, mut rx) = tokio::sync::watch::channel(Bytes::new());

        tx.send_replace(Bytes::from_static(b"frame-1"));
        tx.send_replace(Bytes::from_static(b"frame-2"));
        tx.send_replace(Bytes::from_static(b"frame-3"));

        rx.changed().await.unwrap();
        assert_eq!(&*rx.borrow_and_update().clone(), b"frame-3");

        // Nothing queued behind the newest frame.
        assert!(!rx.has_changed().unwrap());
    }
}
