//! Apportionment of ambiguous reads across candidate sites.

pub mod engine;
pub mod partition;
