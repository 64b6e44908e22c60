//! Study-tracking core: session engine and schedule progress.

pub mod engine;
pub mod schedule;
