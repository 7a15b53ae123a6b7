pub mod service;
pub mod task;
