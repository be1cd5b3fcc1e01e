pub mod capture_backend;
pub mod frame_sink;
