//! Shared error types
//!
//! Each component defines its own error enum; this module provides the
//! umbrella error used at the coordinator and binary level, plus the
//! conversions that let `?` flow component errors upward.

use thiserror::Error;

/// Top-level error for hub startup and coordination
#[derive(Error, Debug)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("CAN link error: {0}")]
    Can(#[from] crate::can::CanLinkError),

    #[error("printer link error: {0}")]
    Klipper(#[from] crate::klipper::KlipperError),

    #[error("mapping error: {0}")]
    Mapping(#[from] crate::mapping::MappingError),

    #[error("Spoolman error: {0}")]
    Spoolman(#[from] crate::spoolman::SpoolmanError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{0}")]
    Other(String),
}

impl HubError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Result alias using HubError
pub type HubResult<T> = Result<T, HubError>;
