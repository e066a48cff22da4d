pub mod cleanup;
pub mod clinic;
pub mod config;
pub mod db;
pub mod import;
pub mod model;
pub mod parser;
pub mod processor;
pub mod queue;
