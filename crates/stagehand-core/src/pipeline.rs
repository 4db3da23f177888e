//! Staged pipeline orchestration.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::advice::{Advice, AdviceRegistry};
use crate::error::{AbortSignal, PipelineError, Result};
use crate::event::{Event, Stage};
use crate::spec::Spec;
use crate::toolchain::Toolchain;

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    NotStarted,
    Preparing,
    Compiling,
    Assembling,
    Linking,
    Done,
    Aborted,
}

impl PipelineState {
    fn running(stage: Stage) -> Self {
        match stage {
            Stage::Prepare => PipelineState::Preparing,
            Stage::Compile => PipelineState::Compiling,
            Stage::Assemble => PipelineState::Assembling,
            Stage::Link => PipelineState::Linking,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineState::NotStarted => "not_started",
            PipelineState::Preparing => "preparing",
            PipelineState::Compiling => "compiling",
            PipelineState::Assembling => "assembling",
            PipelineState::Linking => "linking",
            PipelineState::Done => "done",
            PipelineState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single-use run of a toolchain with its advice table.
pub struct Pipeline {
    toolchain: Arc<dyn Toolchain>,
    advices: AdviceRegistry,
    state: PipelineState,
    run_id: Uuid,
    completed: Vec<Stage>,
}

impl Pipeline {
    pub fn new(toolchain: Arc<dyn Toolchain>) -> Self {
        Self::with_advices(toolchain, AdviceRegistry::new())
    }

    pub fn with_advices(toolchain: Arc<dyn Toolchain>, advices: AdviceRegistry) -> Self {
        Self {
            toolchain,
            advices,
            state: PipelineState::NotStarted,
            run_id: Uuid::new_v4(),
            completed: Vec::new(),
        }
    }

    /// Bind an advice to an event (registration order priority).
    pub fn advise(&mut self, event: Event, advice: Arc<dyn Advice>) -> &mut Self {
        self.advices.register(event, advice);
        self
    }

    pub fn advices(&self) -> &AdviceRegistry {
        &self.advices
    }

    pub fn advices_mut(&mut self) -> &mut AdviceRegistry {
        &mut self.advices
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stages whose body and advices finished, in order.
    pub fn completed_stages(&self) -> &[Stage] {
        &self.completed
    }

    /// Run prepare, compile, assemble and link against `spec`.
    ///
    /// Stages run strictly in order and are never retried. An abort signal
    /// leaves the pipeline in [`PipelineState::Aborted`]; any other failure
    /// leaves it in the state of the stage that failed. `cleanup` advices
    /// run on every exit path.
    pub async fn run(&mut self, spec: &mut Spec) -> Result<()> {
        if self.state != PipelineState::NotStarted {
            return Err(PipelineError::AlreadyRun(self.state.to_string()));
        }

        let start = Instant::now();
        info!(
            run_id = %self.run_id,
            toolchain = self.toolchain.name(),
            "Starting pipeline"
        );

        let result = self.run_stages(spec).await;
        if let Err(err) = &result {
            if err.is_abort() {
                self.state = PipelineState::Aborted;
            }
        }

        let cleanup = self.advices.invoke(Event::Cleanup, spec).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match (result, cleanup) {
            (Ok(()), Ok(())) => {
                info!(run_id = %self.run_id, duration_ms, "Pipeline completed");
                Ok(())
            }
            (Ok(()), Err(err)) => {
                if err.is_abort() {
                    self.state = PipelineState::Aborted;
                    info!(run_id = %self.run_id, duration_ms, reason = %err, "Pipeline aborted during cleanup");
                } else {
                    warn!(run_id = %self.run_id, error = %err, "Cleanup failed");
                }
                Err(err)
            }
            (Err(err), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(run_id = %self.run_id, error = %cleanup_err, "Cleanup failed after pipeline error");
                }
                if err.is_abort() {
                    info!(run_id = %self.run_id, duration_ms, reason = %err, "Pipeline aborted");
                } else {
                    warn!(run_id = %self.run_id, duration_ms, state = %self.state, error = %err, "Pipeline failed");
                }
                Err(err)
            }
        }
    }

    async fn run_stages(&mut self, spec: &mut Spec) -> Result<()> {
        for stage in Stage::ALL {
            self.state = PipelineState::running(stage);
            info!(run_id = %self.run_id, stage = %stage, "Executing stage");

            self.advices.invoke(Event::Before(stage), spec).await?;
            self.toolchain
                .execute(stage, spec)
                .map_err(|source| stage_error(stage, source))?;
            self.advices.invoke(Event::After(stage), spec).await?;

            self.completed.push(stage);
        }
        self.state = PipelineState::Done;
        Ok(())
    }
}

/// A stage body may halt the pipeline by returning an [`AbortSignal`].
fn stage_error(stage: Stage, source: anyhow::Error) -> PipelineError {
    match source.downcast::<AbortSignal>() {
        Ok(signal) => PipelineError::Aborted(signal),
        Err(source) => PipelineError::Stage { stage, source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advice::advice_fn;
    use crate::error::AdviceError;
    use crate::toolchain::NullToolchain;
    use serde_json::json;

    fn tracer(label: impl Into<String>) -> Arc<dyn Advice> {
        let label = label.into();
        advice_fn(label.clone(), move |spec: &mut Spec| {
            let mut trace = spec.get_string_list("trace");
            trace.push(label.clone());
            spec.set("trace", json!(trace));
            Ok(())
        })
    }

    struct FailingLink;

    impl Toolchain for FailingLink {
        fn name(&self) -> &str {
            "failing-link"
        }

        fn link(&self, _spec: &mut Spec) -> anyhow::Result<()> {
            anyhow::bail!("linker exploded")
        }
    }

    #[tokio::test]
    async fn test_events_fire_around_each_stage() {
        let mut pipeline = Pipeline::new(Arc::new(NullToolchain));
        for stage in Stage::ALL {
            pipeline.advise(Event::Before(stage), tracer(Event::Before(stage).name()));
            pipeline.advise(Event::After(stage), tracer(Event::After(stage).name()));
        }
        pipeline.advise(Event::Cleanup, tracer("cleanup"));

        let mut spec = Spec::new();
        pipeline.run(&mut spec).await.unwrap();

        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(pipeline.completed_stages(), &Stage::ALL);
        assert_eq!(
            spec.get_string_list("trace"),
            vec![
                "before_prepare",
                "after_prepare",
                "before_compile",
                "after_compile",
                "before_assemble",
                "after_assemble",
                "before_link",
                "after_link",
                "cleanup",
            ]
        );
    }

    #[tokio::test]
    async fn test_abort_halts_and_runs_cleanup() {
        let mut pipeline = Pipeline::new(Arc::new(NullToolchain));
        pipeline.advise(
            Event::After(Stage::Compile),
            advice_fn("abort", |_spec: &mut Spec| {
                Err(AdviceError::Abort(AbortSignal::new("tests failed").with_return_code(1)))
            }),
        );
        pipeline.advise(Event::Cleanup, tracer("cleanup"));

        let mut spec = Spec::new();
        let err = pipeline.run(&mut spec).await.unwrap_err();

        assert!(err.is_abort());
        assert_eq!(pipeline.state(), PipelineState::Aborted);
        assert_eq!(pipeline.completed_stages(), &[Stage::Prepare]);
        assert_eq!(spec.get_str("compile"), Some("compiled"));
        assert!(!spec.contains("assemble"));
        assert!(!spec.contains("link"));
        assert_eq!(spec.get_string_list("trace"), vec!["cleanup"]);
    }

    #[tokio::test]
    async fn test_stage_error_propagates_verbatim() {
        let mut pipeline = Pipeline::new(Arc::new(FailingLink));
        let mut spec = Spec::new();
        let err = pipeline.run(&mut spec).await.unwrap_err();

        match &err {
            PipelineError::Stage { stage, source } => {
                assert_eq!(*stage, Stage::Link);
                assert_eq!(source.to_string(), "linker exploded");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_abort());
        assert_eq!(pipeline.state(), PipelineState::Linking);
    }

    struct AbortingAssemble;

    impl Toolchain for AbortingAssemble {
        fn name(&self) -> &str {
            "aborting-assemble"
        }

        fn assemble(&self, _spec: &mut Spec) -> anyhow::Result<()> {
            Err(AbortSignal::new("nothing to assemble").into())
        }
    }

    #[tokio::test]
    async fn test_stage_can_abort() {
        let mut pipeline = Pipeline::new(Arc::new(AbortingAssemble));
        let mut spec = Spec::new();
        let err = pipeline.run(&mut spec).await.unwrap_err();

        assert!(err.is_abort());
        assert_eq!(pipeline.state(), PipelineState::Aborted);
        assert_eq!(pipeline.completed_stages(), &[Stage::Prepare, Stage::Compile]);
    }

    #[tokio::test]
    async fn test_cleanup_error_surfaces_only_on_success() {
        let mut pipeline = Pipeline::new(Arc::new(NullToolchain));
        pipeline.advise(
            Event::Cleanup,
            advice_fn("bad-cleanup", |_spec: &mut Spec| {
                Err(AdviceError::Failed(anyhow::anyhow!("could not remove")))
            }),
        );

        let mut spec = Spec::new();
        let err = pipeline.run(&mut spec).await.unwrap_err();
        assert!(matches!(err, PipelineError::Advice { event: Event::Cleanup, .. }));
        assert_eq!(pipeline.state(), PipelineState::Done);
    }

    #[tokio::test]
    async fn test_cleanup_abort_marks_pipeline_aborted() {
        let mut pipeline = Pipeline::new(Arc::new(NullToolchain));
        pipeline.advise(
            Event::Cleanup,
            advice_fn("late-abort", |_spec: &mut Spec| {
                Err(AdviceError::Abort(AbortSignal::new("late failure")))
            }),
        );

        let mut spec = Spec::new();
        let err = pipeline.run(&mut spec).await.unwrap_err();

        assert!(err.is_abort());
        assert_eq!(pipeline.state(), PipelineState::Aborted);
        assert_eq!(pipeline.completed_stages(), &Stage::ALL);
        assert_eq!(spec.get_str("link"), Some("linked"));
    }

    #[tokio::test]
    async fn test_pipeline_is_single_use() {
        let mut pipeline = Pipeline::new(Arc::new(NullToolchain));
        let mut spec = Spec::new();
        pipeline.run(&mut spec).await.unwrap();

        let err = pipeline.run(&mut spec).await.unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyRun(_)));
    }
}
