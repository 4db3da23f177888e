//! Advices and the registry that dispatches them.
//!
//! An advice is an extension callable bound to an [`Event`]. The registry
//! calls every advice bound to an event in ascending priority order, ties
//! broken by registration order, handing each the same shared [`Spec`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AdviceError, AdviceResult, PipelineError};
use crate::event::Event;
use crate::spec::Spec;

/// An extension callable that acts on the Spec.
#[async_trait]
pub trait Advice: Send + Sync {
    /// Identifier used in logs and error messages.
    fn name(&self) -> &str;

    /// Apply the advice. Effects happen through Spec mutation.
    async fn apply(&self, spec: &mut Spec) -> AdviceResult;
}

/// An advice backed by a plain closure.
pub struct FnAdvice<F> {
    name: String,
    func: F,
}

impl<F> FnAdvice<F>
where
    F: Fn(&mut Spec) -> AdviceResult + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Advice for FnAdvice<F>
where
    F: Fn(&mut Spec) -> AdviceResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, spec: &mut Spec) -> AdviceResult {
        (self.func)(spec)
    }
}

/// Wrap a closure as a shareable advice.
pub fn advice_fn<F>(name: impl Into<String>, func: F) -> Arc<dyn Advice>
where
    F: Fn(&mut Spec) -> AdviceResult + Send + Sync + 'static,
{
    Arc::new(FnAdvice::new(name, func))
}

#[derive(Clone)]
struct Binding {
    priority: i64,
    seq: u64,
    advice: Arc<dyn Advice>,
}

/// Binding table from events to advices.
#[derive(Clone, Default)]
pub struct AdviceRegistry {
    bindings: BTreeMap<Event, Vec<Binding>>,
    next_seq: u64,
}

impl AdviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an advice with its registration order as priority.
    pub fn register(&mut self, event: Event, advice: Arc<dyn Advice>) {
        let priority = self.next_seq as i64;
        self.register_with_priority(event, advice, priority);
    }

    /// Bind an advice with an explicit priority; lower runs first.
    pub fn register_with_priority(&mut self, event: Event, advice: Arc<dyn Advice>, priority: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;

        debug!(event = %event, advice = advice.name(), priority, "Registering advice");

        let bindings = self.bindings.entry(event).or_default();
        let at = bindings.partition_point(|b| (b.priority, b.seq) <= (priority, seq));
        bindings.insert(
            at,
            Binding {
                priority,
                seq,
                advice,
            },
        );
    }

    /// Call every advice bound to `event`, in order.
    ///
    /// An abort signal stops dispatch immediately; any other advice error is
    /// propagated unchanged, never swallowed.
    pub async fn invoke(&self, event: Event, spec: &mut Spec) -> Result<(), PipelineError> {
        let Some(bindings) = self.bindings.get(&event) else {
            return Ok(());
        };

        for binding in bindings {
            let name = binding.advice.name();
            debug!(event = %event, advice = name, "Applying advice");

            match binding.advice.apply(spec).await {
                Ok(()) => {}
                Err(AdviceError::Abort(mut signal)) => {
                    signal.event.get_or_insert(event);
                    return Err(PipelineError::Aborted(signal));
                }
                Err(AdviceError::Launch(source)) => {
                    return Err(PipelineError::Launch {
                        advice: name.to_string(),
                        event,
                        source,
                    });
                }
                Err(AdviceError::Failed(source)) => {
                    return Err(PipelineError::Advice {
                        advice: name.to_string(),
                        event,
                        source,
                    });
                }
            }
        }
        Ok(())
    }

    /// Names of the advices bound to `event`, in dispatch order.
    pub fn advice_names(&self, event: Event) -> Vec<&str> {
        self.bindings
            .get(&event)
            .map(|bindings| bindings.iter().map(|b| b.advice.name()).collect())
            .unwrap_or_default()
    }

    /// Total number of bindings across all events.
    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AdviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for event in self.bindings.keys() {
            map.entry(&event.name(), &self.advice_names(*event));
        }
        map.finish()
    }
}
