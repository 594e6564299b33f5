pub mod db;
mod index;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError};
pub use tables::*;
