pub mod format;

pub use format::{format_bytes, round_percentage};
