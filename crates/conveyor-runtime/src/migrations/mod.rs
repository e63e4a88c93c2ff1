//! Broker schema migrations.

mod builtin;
mod runner;

pub use builtin::builtin_migrations;
pub use runner::{Migration, MigrationRunner};
