pub mod ids;
pub mod time;

pub use ids::TaskId;
pub use time::{now_rfc3339, now_secs};
