pub mod announcement_job;
pub mod announcement_policy;
pub mod announcement_sink;
pub mod cooldown_engine;
