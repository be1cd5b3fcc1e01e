use std::process::{Child, Command, Stdio};

use crate::speech::domain::speech_engine::{SpeechEngine, SpeechEngineFactory};

/// Speech through an espeak-compatible command-line synthesizer.
///
/// Every utterance spawns the program once as
/// `program [args..] -s <rate> -a <amplitude> <text>` and waits for it to
/// exit, which gives the single-use engine lifecycle the worker expects.
#[derive(Clone, Debug)]
pub struct CommandSpeechEngineFactory {
    program: String,
    args: Vec<String>,
    rate: u32,
    volume: f64,
}

impl CommandSpeechEngineFactory {
    pub fn new(program: impl Into<String>, args: Vec<String>, rate: u32, volume: f64) -> Self {
        Self {
            program: program.into(),
            args,
            rate,
            volume,
        }
    }

    fn command(&self, text: &str) -> Command {
        let amplitude = (self.volume.clamp(0.0, 2.0) * 100.0).round() as u32;
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("-s")
            .arg(self.rate.to_string())
            .arg("-a")
            .arg(amplitude.to_string())
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }
}

impl SpeechEngineFactory for CommandSpeechEngineFactory {
    fn acquire(&self) -> Result<Box<dyn SpeechEngine>, Box<dyn std::error::Error>> {
        Ok(Box::new(CommandSpeechEngine {
            factory: self.clone(),
            child: None,
        }))
    }
}

struct CommandSpeechEngine {
    factory: CommandSpeechEngineFactory,
    child: Option<Child>,
}

impl SpeechEngine for CommandSpeechEngine {
    fn speak(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        let child = self
            .factory
            .command(text)
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.factory.program))?;
        let child = self.child.insert(child);
        let status = child.wait()?;
        self.child = None;
        if !status.success() {
            return Err(format!("{} exited with {status}", self.factory.program).into());
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
