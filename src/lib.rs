pub mod common;
pub mod job_center;

pub use job_center::{JobCenter, JobCenterBuilder};
