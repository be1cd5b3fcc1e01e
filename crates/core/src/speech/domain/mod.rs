pub mod speech_engine;
