pub mod config;
pub mod constants;
pub mod detection;
pub mod frame;
