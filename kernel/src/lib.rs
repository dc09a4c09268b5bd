// PITR Kernel
//
// Compacts a commit-ordered change log into one net stream per table.

pub mod compact;
pub mod config;
pub mod filter;
pub mod log;
pub mod merge;
pub mod partition;
pub mod pitr;
pub mod row;
pub mod schema;
pub mod writer;

pub use config::Config;
pub use pitr::{Manifest, Pitr, PitrError};
