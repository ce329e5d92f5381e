pub mod config;
pub mod metrics;
pub mod queue;
pub mod reading;
pub mod scheduler;
pub mod sink;
pub mod uploader;
