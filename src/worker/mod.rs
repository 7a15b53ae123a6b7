pub mod executor;
pub mod handle;
pub mod worker;
