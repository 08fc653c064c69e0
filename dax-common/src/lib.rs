// dax-common - Shared types for the dax data-access layer
//
// Error taxonomy, configuration records and the row/value model consumed by
// every backend client.

pub mod config;
pub mod error;
pub mod value;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use value::*;
