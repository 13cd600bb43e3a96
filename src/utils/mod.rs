//! Utility helpers.

pub mod staging_pool;
