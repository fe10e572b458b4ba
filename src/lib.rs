pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod job;
pub mod maintenance;
pub mod orchestrator;
pub mod params;
pub mod store;
