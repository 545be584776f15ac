//! Core domain primitives.
//!
//! - key: binding names and their total order, sentinel keys
//! - time: wall-clock milliseconds and saturating deadline math

pub mod key;
pub mod time;

pub use key::{BindingKey, BindingState, ObjectId};
pub use time::{deadline_saturating, now_millis};
