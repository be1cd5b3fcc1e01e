/// A single-use text-to-speech engine instance.
///
/// Some synthesis backends corrupt internal state when reused, so callers
/// acquire a fresh instance per utterance and release it afterwards. See
/// [`EngineLease`].
pub trait SpeechEngine {
    /// Speaks `text`, blocking until the audio has finished.
    fn speak(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>>;

    /// Tears the instance down. Called exactly once, also after failures.
    fn release(&mut self);
}

/// Creates [`SpeechEngine`] instances on demand.
pub trait SpeechEngineFactory: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn SpeechEngine>, Box<dyn std::error::Error>>;
}

/// Scoped ownership of one engine instance: acquire, speak, release.
///
/// Release runs from `Drop`, so the instance is torn down on every exit path
/// including errors and unwinding.
pub struct EngineLease {
    engine: Box<dyn SpeechEngine>,
}

impl EngineLease {
    pub fn acquire(factory: &dyn SpeechEngineFactory) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            engine: factory.acquire()?,
        })
    }

    pub fn speak(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.engine.speak(text)
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.engine.release();
    }
}

/// Speaks `text` once on a freshly acquired engine.
pub fn speak_once(
    factory: &dyn SpeechEngineFactory,
    text: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut lease = EngineLease::acquire(factory)?;
    lease.speak(text)
}
