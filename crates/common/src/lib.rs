pub mod config;
pub mod cron;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
