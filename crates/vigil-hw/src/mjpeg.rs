//! Motion-JPEG: a byte stream of back-to-back JPEG images.
//!
//! Works for raw `.mjpeg` files and for `multipart/x-mixed-replace` HTTP
//! bodies alike, since both are split on the JPEG start/end markers and
//! anything between images (multipart headers, boundaries) is ignored.

use crate::frame::{self, Frame};
use crate::source::{FrameSource, SourceError};
use std::io::{self, Read};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const READ_CHUNK: usize = 16 * 1024;
/// Upper bound on buffered bytes while looking for one image.
const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

fn find(haystack: &[u8], needle: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

/// Resumable walk over the segments of the image at the front of a buffer.
///
/// Length-prefixed segments are skipped whole, so an EOI inside an embedded
/// EXIF thumbnail does not end the outer image.
#[derive(Debug, Clone, Copy)]
struct SegmentScan {
    /// Next unparsed offset.
    pos: usize,
    /// Inside entropy-coded scan data.
    entropy: bool,
}

impl SegmentScan {
    fn after_soi() -> Self {
        Self { pos: 2, entropy: false }
    }

    /// End offset (exclusive) of the image once its EOI is buffered.
    fn advance(&mut self, buf: &[u8]) -> Option<usize> {
        loop {
            if self.pos + 1 >= buf.len() {
                return None;
            }
            if self.entropy {
                let Some(i) = buf[self.pos..].iter().position(|&b| b == 0xFF).map(|i| self.pos + i) else {
                    self.pos = buf.len();
                    return None;
                };
                match buf.get(i + 1).copied() {
                    None => {
                        self.pos = i;
                        return None;
                    }
                    // Stuffed byte, restart marker or fill.
                    Some(0x00 | 0xD0..=0xD7) => self.pos = i + 2,
                    Some(0xFF) => self.pos = i + 1,
                    Some(EOI) => return Some(i + 2),
                    Some(_) => {
                        self.pos = i;
                        self.entropy = false;
                    }
                }
                continue;
            }

            if buf[self.pos] != 0xFF {
                // Not a marker where one should be; fall back to scanning.
                self.entropy = true;
                continue;
            }
            match buf[self.pos + 1] {
                0xFF => self.pos += 1,
                EOI => return Some(self.pos + 2),
                0x01 | 0xD0..=0xD8 => self.pos += 2,
                marker => {
                    if self.pos + 4 > buf.len() {
                        return None;
                    }
                    let len = u16::from_be_bytes([buf[self.pos + 2], buf[self.pos + 3]]) as usize;
                    if len < 2 {
                        self.pos += 2;
                        self.entropy = true;
                        continue;
                    }
                    self.pos += 2 + len;
                    self.entropy = marker == SOS;
                }
            }
        }
    }
}

/// Splits a byte stream into JPEG images.
pub struct MjpegReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Set while `buf` starts with the SOI of an image being collected.
    scan: Option<SegmentScan>,
    eof: bool,
}

impl<R: Read> MjpegReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            scan: None,
            eof: false,
        }
    }

    /// Next complete JPEG, or `None` once the stream is exhausted.
    ///
    /// A trailing partial image is dropped.
    pub fn next_image(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            if self.scan.is_none() {
                if let Some(start) = find(&self.buf, SOI) {
                    self.buf.drain(..start);
                    self.scan = Some(SegmentScan::after_soi());
                } else if self.buf.len() > 1 {
                    // Keep a possible split marker byte.
                    let keep_from = self.buf.len() - 1;
                    self.buf.drain(..keep_from);
                }
            }
            if let Some(scan) = self.scan.as_mut() {
                if let Some(end) = scan.advance(&self.buf) {
                    self.scan = None;
                    return Ok(Some(self.buf.drain(..end).collect()));
                }
            }

            if self.eof {
                return Ok(None);
            }
            if self.buf.len() > MAX_IMAGE_BYTES {
                self.buf.clear();
                self.scan = None;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "no JPEG end marker within size limit",
                ));
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.inner.read(&mut chunk) {
                Ok(0) => self.eof = true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// Frame source over any MJPEG byte stream.
pub struct MjpegSource<R> {
    reader: MjpegReader<R>,
    name: String,
    sequence: u64,
}

impl<R: Read> MjpegSource<R> {
    pub fn new(inner: R, name: impl Into<String>) -> Self {
        Self {
            reader: MjpegReader::new(inner),
            name: name.into(),
            sequence: 0,
        }
    }
}

impl<R: Read> FrameSource for MjpegSource<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(jpeg) = self.reader.next_image()? else {
            return Ok(None);
        };
        let sequence = self.sequence;
        self.sequence += 1;
        Ok(Some(Frame::new(frame::decode_rgb(&jpeg)?, sequence)))
    }

    fn describe(&self) -> String {
        format!("mjpeg {}", self.name)
    }
}
