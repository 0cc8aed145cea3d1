//! Corpus index and matcher for blockhash reports.
//!
//! This crate provides:
//! - [`BlockHashIndex`]: the aggregated multi-family hash store, with
//!   ingestion, JSON persistence, and statistics
//! - the matcher: four-way scoring (direct, library-excluded,
//!   frequency-adjusted, uniquely matched) of one blockhash report
//!   against the index

#![forbid(unsafe_code)]

pub mod error;
pub mod index;
pub mod matcher;
pub mod time;

pub use error::DbError;
pub use index::{BlockHashIndex, IndexEntry, IndexStats};
pub use matcher::{FamilyMatch, MatchReport};
