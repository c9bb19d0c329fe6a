//! memquery - the in-memory write buffer and query read path of a time series
//! storage engine
//!
//! Writes land in a [`storage::MemTable`], are flushed to sealed chunk files,
//! and are read back through priority merges, optional disk spills and
//! filter-driven time generation in [`query`].

pub mod config;
pub mod ingestion;
pub mod metrics;
pub mod query;
pub mod storage;
