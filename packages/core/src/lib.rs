//! envshield - short-lived credential injection with guaranteed cleanup.
//!
//! Credentials for a wrapped CLI tool are held in a zeroizing
//! [`vault::SecureStore`], applied to the process environment by the
//! [`configuration::ConfigurationManager`], and wiped again by the
//! [`cleanup::CleanupManager`] whenever the [`trigger::CleanupTrigger`] sees
//! the end of the session: normal exit, crash, timeout, signal or panic.

pub mod cleaner;
pub mod cleanup;
pub mod config;
pub mod configuration;
pub mod error;
pub mod injector;
pub mod logging;
pub mod process;
pub mod snapshot;
pub mod trigger;
pub mod vault;

pub use error::{EngineError, Result};
