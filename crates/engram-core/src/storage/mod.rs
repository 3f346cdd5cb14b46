//! Storage layer
//!
//! SQLite-backed store for memories and their satellites, plus the schema
//! migration table.

mod migrations;
mod sqlite;

pub use migrations::{apply_migrations, Migration, MIGRATIONS};
pub use sqlite::{
    fmt_ts, parse_ts, ContradictionUpdate, Cursor, MemoryFilter, MemoryPage, MemoryPatch,
    MemoryStore, Projection, Result, SortOrder, StoreError, UsageBucket, UsageGroupBy,
};
