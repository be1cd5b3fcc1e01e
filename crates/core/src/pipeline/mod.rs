pub mod detection_cadence_controller;
pub mod live_pipeline;
pub mod overlay;
pub mod pipeline_control;
pub mod pipeline_logger;
pub mod video_source_controller;
