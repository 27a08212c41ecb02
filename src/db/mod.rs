pub mod candidate;
pub mod cluster;
pub mod core;
pub mod decision;
pub mod run;
pub mod schema;
pub mod signature;

pub use core::Database;
