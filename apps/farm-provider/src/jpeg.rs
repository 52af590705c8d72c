//! Splits a byte stream into JPEG images by their SOI/EOI markers.

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub struct JpegFramer {
    buf: BytesMut,
    max_frame: usize,
    in_frame: bool,
    /// Bytes of the current frame already searched for EOI.
    scanned: usize,
}

impl JpegFramer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_frame,
            in_frame: false,
            scanned: 0,
        }
    }

    /// Feeds a chunk and returns every image it completed. Frames longer than
    /// the cap are dropped whole.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            if !self.in_frame {
                match find(&self.buf, &SOI, 0) {
                    Some(start) => {
                        self.buf.advance(start);
                        self.in_frame = true;
                        self.scanned = SOI.len();
                    }
                    None => {
                        // Keep a trailing 0xFF in case the marker is split.
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        let drop = self.buf.len() - keep;
                        self.buf.advance(drop);
                        break;
                    }
                }
            }

            let from = self.scanned.saturating_sub(1).max(SOI.len());
            match find(&self.buf, &EOI, from) {
                Some(end) => {
                    let frame = self.buf.split_to(end + EOI.len()).freeze();
                    self.in_frame = false;
                    self.scanned = 0;
                    if frame.len() <= self.max_frame {
                        frames.push(frame);
                    } else {
                        debug!(len = frame.len(), "dropping oversized frame");
                    }
                }
                None => {
                    if self.buf.len() > self.max_frame {
                        debug!(len = self.buf.len(), "discarding oversized partial frame");
                        self.buf.clear();
                        self.in_frame = false;
                        self.scanned = 0;
                    } else {
                        self.scanned = self.buf.len();
                    }
                    break;
                }
            }
        }
        frames
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Boundary used for `multipart/x-mixed-replace` responses.
pub const BOUNDARY: &str = "farmframe";

pub fn multipart_content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

/// Wraps one image as a multipart part.
pub fn multipart_part(frame: &[u8]) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}
