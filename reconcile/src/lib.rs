pub mod backfill;
pub mod health;
pub mod identity;
pub mod ingest;
pub mod report;
pub mod store;
pub mod transaction;
