//! Database module: pool bootstrap, entity models and SQL repositories.
//!
//! - `model`: typed rows returned by repositories.
//! - `repo`: job status and queue SQL.
//! - `clinic`: SQL behind the clinic domain operations.
//!
//! Callers import from `clinic_import::db`; the repository API is re-exported here.

pub mod clinic;
pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{QueueTask, TaskState};
