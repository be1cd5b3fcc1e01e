use crate::shared::frame::Frame;

/// Consumes annotated frames produced by the live pipeline.
pub trait FrameSink: Send {
    fn emit(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>>;
}
