//! Capability contract for frame acquisition.
//!
//! The frame-loop scheduler only ever talks to a [`FrameSource`]. A real
//! camera backend (V4L2, libcamera, ...) is out of scope for this crate; the
//! file-backed source here plays back a directory of images in sorted order
//! and exists so the scheduler, matcher, and fusion stack can be exercised
//! end to end without hardware.

use std::path::{Path, PathBuf};

use image::DynamicImage;

use crate::error::{LocatorError, Result};

/// One acquired frame plus the monotonic timestamp it was captured at.
pub struct Frame {
    pub image: DynamicImage,
    pub timestamp: f64,
}

/// Open/grab/close contract every frame source implements. `grab` is called
/// once per scheduler tick; a source with no frame ready returns
/// [`LocatorError::Transient`] rather than blocking indefinitely.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<()>;
    fn grab(&mut self) -> Result<Frame>;
    fn close(&mut self) -> Result<()>;
}

/// Replays a sorted directory of image files, one per `grab` call,
/// advancing a synthetic timestamp by a fixed step. Used for integration
/// tests and offline replay of recorded flights; never selected by a real
/// deployment config.
pub struct FileFrameSource {
    paths: Vec<PathBuf>,
    index: usize,
    frame_period_s: f64,
    next_timestamp: f64,
    opened: bool,
}

impl FileFrameSource {
    pub fn new(dir: &Path, frame_period_s: f64) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| LocatorError::ResourceUnavailable(format!("reading frame dir {}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()).as_deref(),
                    Some("png") | Some("jpg") | Some("jpeg")
                )
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(LocatorError::ResourceUnavailable(format!(
                "no frame images found in {}",
                dir.display()
            )));
        }

        Ok(Self {
            paths,
            index: 0,
            frame_period_s,
            next_timestamp: 0.0,
            opened: false,
        })
    }
}

impl FrameSource for FileFrameSource {
    fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn grab(&mut self) -> Result<Frame> {
        if !self.opened {
            return Err(LocatorError::ResourceUnavailable("frame source not opened".into()));
        }
        if self.index >= self.paths.len() {
            return Err(LocatorError::Transient("replay exhausted".into()));
        }

        let path = &self.paths[self.index];
        let image = image::open(path).map_err(|e| LocatorError::Transient(format!("decoding {}: {e}", path.display())))?;
        let timestamp = self.next_timestamp;

        self.index += 1;
        self.next_timestamp += self.frame_period_s;

        Ok(Frame { image, timestamp })
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn write_png(path: &Path) {
        let img = ImageBuffer::from_pixel(8, 8, Luma([128u8]));
        img.save(path).unwrap();
    }

    #[test]
    fn replays_sorted_files_with_increasing_timestamps() {
        let dir = std::env::temp_dir().join(format!("locator-camera-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        write_png(&dir.join("b.png"));
        write_png(&dir.join("a.png"));

        let mut source = FileFrameSource::new(&dir, 0.1).unwrap();
        source.open().unwrap();

        let first = source.grab().unwrap();
        let second = source.grab().unwrap();
        assert!(second.timestamp > first.timestamp);
        assert!((second.timestamp - first.timestamp - 0.1).abs() < 1e-9);

        let err = source.grab().unwrap_err();
        assert!(matches!(err, LocatorError::Transient(_)));

        source.close().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_directory_contents_is_resource_unavailable() {
        let dir = std::env::temp_dir().join(format!("locator-camera-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let err = FileFrameSource::new(&dir, 0.1).unwrap_err();
        assert!(matches!(err, LocatorError::ResourceUnavailable(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn grab_before_open_is_rejected() {
        let dir = std::env::temp_dir().join(format!("locator-camera-unopened-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        write_png(&dir.join("a.png"));
        let mut source = FileFrameSource::new(&dir, 0.1).unwrap();
        assert!(matches!(source.grab().unwrap_err(), LocatorError::ResourceUnavailable(_)));
        std::fs::remove_dir_all(&dir).ok();
    }
}
