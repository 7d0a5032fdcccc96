//! Core helpers shared by the decode backends and the pipeline.
//! All timestamps exchanged with the consumer are milliseconds (i64).

pub mod time;

pub use time::Millis;
