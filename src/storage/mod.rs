mod blobs;
pub mod db;
mod links;
pub mod models;
mod queue;
mod tables;

pub use db::{Database, DatabaseError};
pub use queue::Claim;
pub use tables::*;
