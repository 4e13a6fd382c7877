//! Kanade Common - Shared configuration, error types and logging for the Kanade bot.
//!
//! This crate provides:
//! - Configuration types, loading and environment overrides
//! - Error types and handling utilities
//! - Logging setup and span helpers
//! - Small string utilities used across the workspace

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;

pub use config::{
    BotConfig, DiscordConfig, MemoryConfig, ModelConfig, ObservabilityConfig, PersonaConfig,
    ServerConfig,
};
pub use error::{Error, Result};

