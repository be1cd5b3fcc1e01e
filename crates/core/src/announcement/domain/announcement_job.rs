use std::num::NonZeroU32;
use std::time::Duration;

/// A unit of speech work: say `text` `repeat` times, pausing `gap` between
/// repetitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnouncementJob {
    text: String,
    repeat: NonZeroU32,
    gap: Duration,
}

impl AnnouncementJob {
    pub fn new(text: impl Into<String>, repeat: u32, gap: Duration) -> Result<Self, &'static str> {
        let repeat = NonZeroU32::new(repeat).ok_or("repeat must be >= 1")?;
        Ok(Self {
            text: text.into(),
            repeat,
            gap,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn repeat(&self) -> u32 {
        self.repeat.get()
    }

    pub fn gap(&self) -> Duration {
        self.gap
    }
}
