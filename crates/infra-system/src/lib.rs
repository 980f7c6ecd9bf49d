// Eventjobs Infrastructure - System Adapters
// Implements: JobConsumer backed by external processes

pub mod command_consumer;

pub use command_consumer::{CommandConsumer, CommandSpec};
