// Declare the modules to re-export
pub mod configs;
pub mod core;
#[cfg(feature = "loggers")]
pub mod loggers;

// Re-export everything
pub use crate::configs::*;
pub use crate::core::*;
#[cfg(feature = "loggers")]
pub use crate::loggers::*;
