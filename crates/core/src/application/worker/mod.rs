// Worker support - shutdown signalling, panic isolation, constants

pub mod constants;
mod panic_guard;
mod shutdown;

pub use panic_guard::{classify_join_error, panic_message, TaskFailure};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};
