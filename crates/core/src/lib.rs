pub mod announcement;
pub mod detection;
pub mod pipeline;
pub mod shared;
pub mod speech;
pub mod video;
