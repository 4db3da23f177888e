//! Stagehand Core - staged toolchain pipeline
//!
//! Provides the pieces every Stagehand run is built from:
//! - a shared, mutable [`Spec`] threaded through the run
//! - an [`AdviceRegistry`] dispatching extension advices on named events
//! - the [`Toolchain`] trait and the four-stage [`Pipeline`]
//! - an [`ExtensionRegistry`] loaded from a static manifest
//!
//! Aborting on purpose is a distinct [`PipelineError::Aborted`] variant,
//! never confused with a crashing stage or advice.

pub mod advice;
pub mod error;
pub mod event;
pub mod extension;
pub mod pipeline;
pub mod spec;
pub mod telemetry;
pub mod toolchain;

// Re-export key types
pub use advice::{advice_fn, Advice, AdviceRegistry, FnAdvice};
pub use error::{AbortSignal, AdviceError, AdviceResult, LaunchFailure, ManifestError, PipelineError};
pub use event::{Event, Stage};
pub use extension::{CommandAdvice, ExtensionManifest, ExtensionRegistry, ResolvedAdvice};
pub use pipeline::{Pipeline, PipelineState};
pub use spec::{keys, Spec};
pub use telemetry::init_tracing;
pub use toolchain::{NullToolchain, Toolchain};
