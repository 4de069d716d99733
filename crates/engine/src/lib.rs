pub mod idempotency;
pub mod ott;
pub mod rate_limiter;
pub mod retry;
