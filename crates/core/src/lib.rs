pub mod calendar;
pub mod notify;
pub mod program;
pub mod projector;
pub mod types;
pub mod workflow;
