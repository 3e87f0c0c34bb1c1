pub mod record;
pub mod timestamp;

pub use record::{validate_row, RawRow};
pub use timestamp::{normalize_created_at, parse_iso8601};
