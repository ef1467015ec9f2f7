pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod ingest;
pub mod mqtt;
pub mod supervisor;
