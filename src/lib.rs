pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod global;
pub mod intake;
pub mod meeting;
pub mod orchestrator;
pub mod providers;
pub mod scheduler;
