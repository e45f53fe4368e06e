//! Topic filters
//!
//! Validation of the filter a bridge subscribes to, and matching of
//! inbound topic names against it.

mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter};
