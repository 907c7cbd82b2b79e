//! Persistence layer for campaignd: connection pooling, migrations, and
//! typed query functions over the `campaigns` and `campaign_runs` tables.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
