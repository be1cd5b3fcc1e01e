use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::shared::frame::Frame;

/// Where frames come from: a numbered capture device or a video file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDescriptor {
    Device(u32),
    File(PathBuf),
}

impl SourceDescriptor {
    /// Live devices are reopened after a failure; files are rewound.
    pub fn is_live(&self) -> bool {
        matches!(self, SourceDescriptor::Device(_))
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDescriptor::Device(index) => write!(f, "camera {index}"),
            SourceDescriptor::File(path) => write!(f, "video file {}", path.display()),
        }
    }
}

#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    EndOfStream,
}

/// An open capture session.
///
/// Implementations hold decoder resources until [`release`](Self::release)
/// is called or the handle is dropped.
pub trait CaptureHandle: Send {
    /// Decodes the next frame as packed RGB24.
    fn read(&mut self) -> Result<ReadOutcome, Box<dyn std::error::Error>>;

    /// Rewinds a finite source to its first frame.
    fn seek_to_start(&mut self) -> Result<(), Box<dyn std::error::Error>>;

    /// Releases decoder resources. Safe to call more than once.
    fn release(&mut self);
}

/// Opens capture handles for sources.
pub trait CaptureBackend: Send + Sync {
    fn open(
        &self,
        source: &SourceDescriptor,
    ) -> Result<Box<dyn CaptureHandle>, Box<dyn std::error::Error>>;

    /// Device indices in `0..max_index` that open and deliver a frame.
    fn probe_devices(&self, max_index: u32) -> Vec<u32> {
        (0..max_index)
            .filter(|&index| match self.open(&SourceDescriptor::Device(index)) {
                Ok(mut handle) => {
                    let readable = matches!(handle.read(), Ok(ReadOutcome::Frame(_)));
                    handle.release();
                    readable
                }
                Err(e) => {
                    log::debug!("Camera {index} unavailable: {e}");
                    false
                }
            })
            .collect()
    }
}
