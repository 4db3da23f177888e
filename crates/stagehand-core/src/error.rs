//! Error taxonomy for pipeline runs.
//!
//! Callers must be able to tell three situations apart:
//!
//! - the pipeline was **aborted** on purpose (an advice raised an
//!   [`AbortSignal`], normally because tests failed),
//! - an external process could not be **launched** at all,
//! - a stage or advice **crashed** (a defect in toolchain or extension code).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::{Event, Stage};

/// Control-flow signal that halts the remaining stages and advices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortSignal {
    /// Why the pipeline was halted.
    pub reason: String,

    /// Return code of the external run that triggered the abort, if any.
    pub return_code: Option<i32>,

    /// Event whose dispatch raised the signal (filled in by the registry).
    pub event: Option<Event>,
}

impl AbortSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            return_code: None,
            event: None,
        }
    }

    pub fn with_return_code(mut self, code: i32) -> Self {
        self.return_code = Some(code);
        self
    }
}

impl fmt::Display for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)?;
        if let Some(code) = self.return_code {
            write!(f, " (return code {})", code)?;
        }
        if let Some(event) = &self.event {
            write!(f, " during {}", event)?;
        }
        Ok(())
    }
}

impl std::error::Error for AbortSignal {}

/// An external program could not be started.
#[derive(Debug, thiserror::Error)]
#[error("could not launch '{program}': {source}")]
pub struct LaunchFailure {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Errors returned by an [`Advice`](crate::advice::Advice).
#[derive(Debug, thiserror::Error)]
pub enum AdviceError {
    #[error("abort requested: {0}")]
    Abort(AbortSignal),

    #[error(transparent)]
    Launch(#[from] LaunchFailure),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Errors produced while loading an extension manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown advice: {0}")]
    UnknownAdvice(String),

    #[error("unknown package: {0}")]
    UnknownPackage(String),

    #[error("package {package} refers to unknown registry {registry}")]
    UnknownRegistry { package: String, registry: String },

    #[error("advice {0} has an empty command")]
    EmptyCommand(String),

    #[error("duplicate {kind} entry: {name}")]
    Duplicate { kind: &'static str, name: String },
}

/// Errors surfaced by a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline aborted: {0}")]
    Aborted(AbortSignal),

    #[error("advice '{advice}' during {event}: {source}")]
    Launch {
        advice: String,
        event: Event,
        #[source]
        source: LaunchFailure,
    },

    #[error("advice '{advice}' failed during {event}: {source}")]
    Advice {
        advice: String,
        event: Event,
        #[source]
        source: anyhow::Error,
    },

    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("pipeline already ran (state: {0})")]
    AlreadyRun(String),
}

impl PipelineError {
    /// Whether this error is the deliberate abort signal rather than a defect.
    pub fn is_abort(&self) -> bool {
        matches!(self, PipelineError::Aborted(_))
    }

    pub fn is_launch_failure(&self) -> bool {
        matches!(self, PipelineError::Launch { .. })
    }

    pub fn abort_signal(&self) -> Option<&AbortSignal> {
        match self {
            PipelineError::Aborted(signal) => Some(signal),
            _ => None,
        }
    }
}

impl From<PipelineError> for AdviceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Aborted(signal) => AdviceError::Abort(signal),
            PipelineError::Launch { source, .. } => AdviceError::Launch(source),
            other => AdviceError::Failed(anyhow::Error::new(other)),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type returned by advices.
pub type AdviceResult = std::result::Result<(), AdviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_signal_display() {
        let mut signal = AbortSignal::new("tests failed").with_return_code(3);
        assert_eq!(signal.to_string(), "tests failed (return code 3)");

        signal.event = Some(Event::Before(Stage::Compile));
        assert_eq!(
            signal.to_string(),
            "tests failed (return code 3) during before_compile"
        );
    }

    #[test]
    fn test_pipeline_error_kinds_are_distinct() {
        let aborted = PipelineError::Aborted(AbortSignal::new("x"));
        assert!(aborted.is_abort());
        assert!(!aborted.is_launch_failure());

        let launch = PipelineError::Launch {
            advice: "karma".to_string(),
            event: Event::Before(Stage::Compile),
            source: LaunchFailure {
                program: "karma".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            },
        };
        assert!(launch.is_launch_failure());
        assert!(!launch.is_abort());
        assert!(launch.to_string().contains("could not launch 'karma'"));
    }

    #[test]
    fn test_nested_pipeline_error_keeps_kind_as_advice_error() {
        let err: AdviceError = PipelineError::Aborted(AbortSignal::new("stop")).into();
        assert!(matches!(err, AdviceError::Abort(_)));

        let err: AdviceError = PipelineError::Config("bad".to_string()).into();
        assert!(matches!(err, AdviceError::Failed(_)));
    }
}
