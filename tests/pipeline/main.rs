//! Outbox pipeline integration tests.

mod publish;
mod dispatcher;
mod channel_pool;
