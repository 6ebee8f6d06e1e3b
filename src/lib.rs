pub mod aggregate;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod models;
pub mod navigator;
pub mod normalize;
pub mod rates;
pub mod report;
pub mod session;
pub mod snapshot;
pub mod source;
