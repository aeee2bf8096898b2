//! Dispatch: queue message routing and lifetime enforcement.

mod dispatcher;
mod lifetime;

pub use dispatcher::{Dispatcher, DispatcherConfig, Disposition};
pub use lifetime::QueueLifetimeConfig;
