//! Configuration loading and shared configuration types for the celoe ETL system.
//!
//! Configuration is loaded hierarchically: a base file, an environment-specific file
//! and `APP_`-prefixed environment variable overrides, in that order of precedence.

pub mod environment;
pub mod load;
mod secret;
pub mod shared;

pub use secret::SerializableSecretString;
