//! Local workflow supervisor.
//!
//! Routes — named, ordered chains of child processes — are declared in a
//! YAML manifest and executed under a single host-wide daemon. The first
//! `op` invocation on a host becomes the daemon; later invocations
//! register as clients over a localhost HTTP endpoint and are multiplexed
//! through per-client FIFO triplets, with cooperative cancellation flowing
//! daemon → command → route → proc.

pub mod cli;
pub mod client;
pub mod command;
pub mod daemon;
pub mod manifest;
pub mod meta;
pub mod proc;
pub mod registry;
pub mod route;
pub mod settings;
pub mod sink;
pub mod template;
pub mod wire;
