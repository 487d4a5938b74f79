pub mod budget;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod normalize;
pub mod orchestrator;
pub mod output;
pub mod providers;
pub mod queue;
pub mod rate_limit;
pub mod store;
