use std::io::Write;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::shared::constants::MJPEG_BOUNDARY;
use crate::shared::frame::Frame;
use crate::video::domain::frame_sink::FrameSink;

const DEFAULT_QUALITY: u8 = 80;

/// Encodes an RGB frame as baseline JPEG.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if frame.channels() != 3 {
        return Err(format!("expected an RGB frame, got {} channels", frame.channels()).into());
    }
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode(
        frame.data(),
        frame.width(),
        frame.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}

/// Writes frames as `multipart/x-mixed-replace` MJPEG parts.
///
/// Each part is `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`, which
/// browsers render as a live stream when served with [`Self::content_type`].
pub struct MjpegStreamSink<W: Write + Send> {
    writer: W,
    quality: u8,
}

impl<W: Write + Send> MjpegStreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            quality: DEFAULT_QUALITY,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.clamp(1, 100);
        self
    }

    pub fn content_type() -> String {
        format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}")
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> FrameSink for MjpegStreamSink<W> {
    fn emit(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        let jpeg = encode_jpeg(frame, self.quality)?;
        write!(
            self.writer,
            "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n"
        )?;
        self.writer.write_all(&jpeg)?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps a single JPEG file updated with the latest frame.
///
/// Frames are written to a sibling `.part` file and renamed over the target,
/// so readers never observe a half-written image.
pub struct SnapshotFileSink {
    path: PathBuf,
    quality: u8,
}

impl SnapshotFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            quality: DEFAULT_QUALITY,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn part_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".part");
        self.path.with_file_name(name)
    }
}

impl FrameSink for SnapshotFileSink {
    fn emit(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let jpeg = encode_jpeg(frame, self.quality)?;
        let part = self.part_path();
        std::fs::write(&part, jpeg)?;
        std::fs::rename(&part, &self.path)?;
        Ok(())
    }
}
