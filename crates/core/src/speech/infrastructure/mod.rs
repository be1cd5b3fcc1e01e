pub mod command_speech_engine;
pub mod speech_worker;
