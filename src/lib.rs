//! Mail bridge: connects chat rooms to email accounts.

pub mod accounts;
pub mod channels;
pub mod commands;
pub mod compose;
pub mod config;
pub mod error;
pub mod markdown;
pub mod notifier;
pub mod pipeline;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
