pub mod floating;
pub mod models;
pub mod recurrence;
