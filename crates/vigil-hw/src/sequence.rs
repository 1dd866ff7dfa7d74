//! Still images as a finite frame source.

use crate::frame::{self, Frame};
use crate::source::{FrameSource, SourceError};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
}

/// Images played back one per frame, in file-name order.
pub struct ImageSequence {
    pending: VecDeque<PathBuf>,
    name: String,
    sequence: u64,
}

impl ImageSequence {
    /// Every image file directly inside `dir`.
    pub fn from_dir(dir: &Path) -> Result<Self, SourceError> {
        let io_err = |source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        paths.sort();

        tracing::info!(dir = %dir.display(), count = paths.len(), "image sequence");
        Ok(Self {
            pending: paths.into(),
            name: dir.display().to_string(),
            sequence: 0,
        })
    }

    pub fn single(path: &Path) -> Self {
        Self {
            pending: VecDeque::from([path.to_path_buf()]),
            name: path.display().to_string(),
            sequence: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(path) = self.pending.pop_front() else {
            return Ok(None);
        };
        let bytes = fs::read(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        let image = frame::decode_rgb(&bytes)?;

        let sequence = self.sequence;
        self.sequence += 1;
        tracing::debug!(path = %path.display(), sequence, "image frame");
        Ok(Some(Frame::new(image, sequence)))
    }

    fn describe(&self) -> String {
        format!("images {}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn save(dir: &Path, name: &str, shade: u8) {
        RgbImage::from_pixel(4, 4, Rgb([shade, shade, shade]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn test_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "b.png", 20);
        save(dir.path(), "a.png", 10);
        save(dir.path(), "c.bmp", 30);
        fs::write(dir.path().join("readme.txt"), b"skip me").unwrap();

        let mut seq = ImageSequence::from_dir(dir.path()).unwrap();
        assert_eq!(seq.remaining(), 3);
        let shades: Vec<u8> = std::iter::from_fn(|| seq.next_frame().unwrap())
            .map(|f| f.image.get_pixel(0, 0).0[0])
            .collect();
        assert_eq!(shades, vec![10, 20, 30]);
    }

    #[test]
    fn test_unreadable_image_is_one_failed_read() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.jpg"), b"broken").unwrap();
        save(dir.path(), "b.png", 99);

        let mut seq = ImageSequence::from_dir(dir.path()).unwrap();
        assert!(seq.next_frame().is_err());
        let frame = seq.next_frame().unwrap().unwrap();
        assert_eq!(frame.sequence, 0);
        assert!(seq.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_single_image() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), "one.png", 5);
        let mut seq = ImageSequence::single(&dir.path().join("one.png"));
        assert!(seq.next_frame().unwrap().is_some());
        assert!(seq.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_missing_directory() {
        assert!(ImageSequence::from_dir(Path::new("/nonexistent/frames")).is_err());
    }
}
