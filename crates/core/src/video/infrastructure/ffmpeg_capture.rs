use ffmpeg_next::format::context::Input;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::video::Video;

use crate::shared::frame::Frame;
use crate::video::domain::capture_backend::{
    CaptureBackend, CaptureHandle, ReadOutcome, SourceDescriptor,
};

/// Opens video files and capture devices via ffmpeg-next
/// (libavformat + libavdevice + libavcodec).
///
/// Devices map to `video4linux2` on Linux (`/dev/videoN`) and
/// `avfoundation` on macOS. Other platforms only support files.
#[derive(Debug, Default)]
pub struct FfmpegCaptureBackend;

impl FfmpegCaptureBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for FfmpegCaptureBackend {
    fn open(
        &self,
        source: &SourceDescriptor,
    ) -> Result<Box<dyn CaptureHandle>, Box<dyn std::error::Error>> {
        ffmpeg_next::init()?;

        let input = match source {
            SourceDescriptor::File(path) => ffmpeg_next::format::input(path)?,
            SourceDescriptor::Device(index) => open_device(*index)?,
        };
        let handle = FfmpegCaptureHandle::new(input)?;
        log::info!(
            "Opened {source} ({}x{}, {})",
            handle.decoder.width(),
            handle.decoder.height(),
            handle.codec_name()
        );
        Ok(Box::new(handle))
    }
}

#[cfg(target_os = "linux")]
fn device_target(index: u32) -> Option<(&'static str, String)> {
    Some(("video4linux2", format!("/dev/video{index}")))
}

#[cfg(target_os = "macos")]
fn device_target(index: u32) -> Option<(&'static str, String)> {
    Some(("avfoundation", format!("{index}:none")))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn device_target(_index: u32) -> Option<(&'static str, String)> {
    None
}

fn open_device(index: u32) -> Result<Input, Box<dyn std::error::Error>> {
    let (format_name, url) =
        device_target(index).ok_or("capture devices are not supported on this platform")?;

    ffmpeg_next::device::register_all();
    let format = ffmpeg_next::device::input::video()
        .find(|f| f.name().split(',').any(|name| name == format_name))
        .ok_or_else(|| format!("ffmpeg was built without the {format_name} input device"))?;

    let mut options = ffmpeg_next::Dictionary::new();
    if format_name == "avfoundation" {
        options.set("framerate", "30");
    }

    let context =
        ffmpeg_next::format::open_with(&url, &ffmpeg_next::format::Format::Input(format), options)?;
    Ok(context.input())
}

/// Decodes frames one at a time from an open input, converting each to RGB24.
pub struct FfmpegCaptureHandle {
    input: Option<Input>,
    decoder: ffmpeg_next::decoder::Video,
    scaler: Option<scaling::Context>,
    stream_index: usize,
    frame_index: usize,
    flushing: bool,
}

// Safety: a capture handle is owned by one pipeline thread at a time.
// The raw pointers inside ffmpeg types are never shared across threads.
unsafe impl Send for FfmpegCaptureHandle {}

impl FfmpegCaptureHandle {
    fn new(input: Input) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or("No video stream found")?;
        let stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = codec_ctx.decoder().video()?;

        Ok(Self {
            input: Some(input),
            decoder,
            scaler: None,
            stream_index,
            frame_index: 0,
            flushing: false,
        })
    }

    fn codec_name(&self) -> String {
        self.decoder
            .codec()
            .map(|c| c.name().to_string())
            .unwrap_or_default()
    }

    fn try_receive(&mut self) -> Result<Option<Frame>, Box<dyn std::error::Error>> {
        let mut decoded = Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }

        let width = decoded.width();
        let height = decoded.height();
        let mut rgb_frame = Video::empty();
        self.scaler_for(&decoded)?.run(&decoded, &mut rgb_frame)?;

        let pixels = extract_rgb_pixels(&rgb_frame, width, height);
        let frame = Frame::new(pixels, width, height, 3, self.frame_index);
        self.frame_index += 1;
        Ok(Some(frame))
    }

    /// Returns a scaler matching the decoded frame, rebuilding it when the
    /// stream changes size or pixel format mid-session.
    fn scaler_for(&mut self, decoded: &Video) -> Result<&mut scaling::Context, ffmpeg_next::Error> {
        let stale = self.scaler.as_ref().is_some_and(|s| {
            let input = s.input();
            input.width != decoded.width()
                || input.height != decoded.height()
                || input.format != decoded.format()
        });
        if stale {
            self.scaler = None;
        }

        let scaler = match self.scaler.take() {
            Some(scaler) => scaler,
            None => scaling::Context::get(
                decoded.format(),
                decoded.width(),
                decoded.height(),
                ffmpeg_next::format::Pixel::RGB24,
                decoded.width(),
                decoded.height(),
                scaling::Flags::BILINEAR,
            )?,
        };
        Ok(self.scaler.insert(scaler))
    }
}

impl CaptureHandle for FfmpegCaptureHandle {
    fn read(&mut self) -> Result<ReadOutcome, Box<dyn std::error::Error>> {
        loop {
            if let Some(frame) = self.try_receive()? {
                return Ok(ReadOutcome::Frame(frame));
            }
            if self.flushing {
                return Ok(ReadOutcome::EndOfStream);
            }

            let input = self.input.as_mut().ok_or("capture handle released")?;
            let mut packet = ffmpeg_next::Packet::empty();
            match packet.read(input) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => {
                    let _ = self.decoder.send_eof();
                    self.flushing = true;
                    continue;
                }
                Err(e) => return Err(Box::new(e)),
            }

            if packet.stream() != self.stream_index {
                continue;
            }
            if let Err(e) = self.decoder.send_packet(&packet) {
                log::debug!("Dropping undecodable packet: {e}");
            }
        }
    }

    fn seek_to_start(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let input = self.input.as_mut().ok_or("capture handle released")?;
        input.seek(0, ..)?;
        self.decoder.flush();
        self.flushing = false;
        self.frame_index = 0;
        Ok(())
    }

    fn release(&mut self) {
        if self.input.take().is_some() {
            log::debug!("Released capture handle");
        }
        self.scaler = None;
    }
}

/// Copies pixel data from an ffmpeg frame into a contiguous RGB buffer.
///
/// ffmpeg frames may have padding bytes at the end of each row (stride > width*3).
/// This function strips that padding to produce a tightly-packed pixel buffer.
fn extract_rgb_pixels(rgb_frame: &Video, width: u32, height: u32) -> Vec<u8> {
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);
    let w = width as usize;
    let h = height as usize;

    let mut pixels = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        let row_start = row * stride;
        pixels.extend_from_slice(&data[row_start..row_start + w * 3]);
    }
    pixels
}
