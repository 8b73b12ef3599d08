pub mod cache;
pub mod catalog;
pub mod config;
pub mod db;
pub mod derived;
pub mod discovery;
pub mod error;
pub mod jobs;
pub mod loader;
pub mod orchestrator;
pub mod query;
pub mod seed;
pub mod store;
pub mod transform;
pub mod types;
pub mod units;
