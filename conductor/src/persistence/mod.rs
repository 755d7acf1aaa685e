/// PostgreSQL persistence for execution records.
///
/// This module provides `PostgresRecordStore`, a PostgreSQL-backed
/// implementation of the [`ExecutionRecordStore`](crate::store::ExecutionRecordStore)
/// trait for durable record storage.
pub mod postgres;

pub use postgres::PostgresRecordStore;
