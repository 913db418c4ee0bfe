//! hanoverd: a per-application supervisor performing zero-downtime handover
//! between successive versions of a containerized network service.
//!
//! A trigger (signal, webhook, stdin) starts a new *generation*: a container
//! is created from a freshly-obtained image, probed until it serves a 200 on
//! its status URI, and only then does the flip controller atomically point
//! the host firewall at it and retire the previously live generation.

pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod firewall;
pub mod flip;
pub mod hookbot;
pub mod latch;
pub mod runtime;
pub mod source;
pub mod supervisor;
pub mod trigger;

pub use config::Options;
pub use container::Generation;
pub use error::{HanoverdError, Result};
pub use latch::{Latch, TaskGroup};
pub use supervisor::Supervisor;
