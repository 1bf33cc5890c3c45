//! Genomic sites, the position index and ambiguous-read deduplication.

pub mod dedup;
pub mod key;
pub mod position_index;
