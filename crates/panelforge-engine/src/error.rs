use std::io;

use panelforge_contracts::batch::FailureClass;
use thiserror::Error;

use crate::upstream::UpstreamError;

/// Tag that decides whether a failed generation attempt is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    ContentPolicy,
    Terminal,
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] UpstreamError),
    #[error("content rejected by upstream policy: {message}")]
    ContentRejected {
        message: String,
        status: Option<u16>,
    },
    #[error("malformed upstream content: {0}")]
    MalformedContent(String),
    #[error("invalid scene: {0}")]
    InvalidScene(String),
    #[error("unrecognized upstream schema: {0}")]
    UnrecognizedSchema(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ForgeError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::UpstreamUnavailable(_) => FailureKind::Transport,
            Self::ContentRejected { .. } => FailureKind::ContentPolicy,
            _ => FailureKind::Terminal,
        }
    }

    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::UpstreamUnavailable(_) => FailureClass::UpstreamUnavailable,
            Self::ContentRejected { .. } => FailureClass::ContentRejected,
            Self::MalformedContent(_) | Self::InvalidScene(_) | Self::UnrecognizedSchema(_) => {
                FailureClass::MalformedContent
            }
            _ => FailureClass::Internal,
        }
    }

    /// Message safe to show an end user; never carries upstream bodies or paths.
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration(_) => {
                "The service is not configured for generation. Please contact the operator."
                    .to_string()
            }
            Self::UpstreamUnavailable(_) => {
                "The generation service is temporarily unavailable. Please try again later."
                    .to_string()
            }
            Self::ContentRejected { .. } => {
                "The content was flagged by the safety filter. Please rephrase the description and try again."
                    .to_string()
            }
            Self::MalformedContent(_) => {
                "The generation service returned an unreadable result. Please try again."
                    .to_string()
            }
            Self::InvalidScene(detail) => format!("The storyboard is incomplete: {detail}."),
            Self::UnrecognizedSchema(_) => {
                "The storyboard format was not recognized.".to_string()
            }
            Self::NotFound(what) => format!("Not found: {what}."),
            Self::InvalidInput(detail) => detail.clone(),
            Self::Io { .. } => "Saving the generated files failed. Please try again.".to_string(),
        }
    }
}

pub fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
