pub mod campaign;
pub mod dispatcher;
pub mod outbox;
pub mod scheduler;
pub mod telegram;
pub mod telemetry;
pub mod worker;
