pub mod error;
pub mod limiters;
pub mod rate_limit;
pub mod retry;
pub mod sanitize;
