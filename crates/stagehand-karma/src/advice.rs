//! Advices that drive the external runner from inside the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use stagehand_core::{Advice, AdviceRegistry, AdviceResult, Event, Spec};
use tracing::debug;

use crate::driver::RunnerDriver;

/// Writes the runner configuration. Bound to `after_prepare`.
pub struct SetupAdvice {
    driver: Arc<dyn RunnerDriver>,
}

impl SetupAdvice {
    pub const NAME: &'static str = "karma-setup";

    pub fn new(driver: Arc<dyn RunnerDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl Advice for SetupAdvice {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, spec: &mut Spec) -> AdviceResult {
        let path = self.driver.setup(spec)?;
        debug!(driver = self.driver.name(), path = %path.display(), "Runner configured");
        Ok(())
    }
}

/// Runs the external runner. Bound to `before_compile`.
///
/// Fires its own `before_karma` hooks before launching and `after_karma`
/// hooks once the outcome is recorded. A hook failure stops the run.
pub struct RunnerAdvice {
    driver: Arc<dyn RunnerDriver>,
    hooks: AdviceRegistry,
}

impl RunnerAdvice {
    pub const NAME: &'static str = "karma-runner";

    pub fn new(driver: Arc<dyn RunnerDriver>) -> Self {
        Self::with_hooks(driver, AdviceRegistry::new())
    }

    /// `hooks` may only bind `before_karma` and `after_karma`; other events
    /// are never fired.
    pub fn with_hooks(driver: Arc<dyn RunnerDriver>, hooks: AdviceRegistry) -> Self {
        Self { driver, hooks }
    }

    pub fn hooks(&self) -> &AdviceRegistry {
        &self.hooks
    }
}

#[async_trait]
impl Advice for RunnerAdvice {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, spec: &mut Spec) -> AdviceResult {
        self.hooks.invoke(Event::BeforeKarma, spec).await?;
        self.driver.run(spec).await?;
        self.hooks.invoke(Event::AfterKarma, spec).await?;
        Ok(())
    }
}
