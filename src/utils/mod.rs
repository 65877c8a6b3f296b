//! Utility functions and helpers
//!
//! This module contains the millisecond clock and atomic file helpers.

pub mod atomic;
pub mod time;

pub use atomic::{atomic_write_with, cleanup_temp_files, remove_with_sidecars};
pub use time::{elapsed_millis, now_millis};
