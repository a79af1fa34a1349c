pub mod config;
pub mod error;
pub mod gate;
pub mod health;
pub mod io;
pub mod keys;
pub mod orchestrator;
pub mod paths;
pub mod probe;
pub mod propagation;
pub mod run;
pub mod scheduler;
pub mod unit;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, RolloutError};
