//! Toolchain definitions.
//!
//! A toolchain supplies the bodies of the four fixed stages. Every stage
//! defaults to a no-op; implementations override only what they need.

use serde_json::Value;

use crate::event::Stage;
use crate::spec::Spec;

/// The stage bodies of a toolchain.
pub trait Toolchain: Send + Sync {
    fn name(&self) -> &str;

    fn prepare(&self, _spec: &mut Spec) -> anyhow::Result<()> {
        Ok(())
    }

    fn compile(&self, _spec: &mut Spec) -> anyhow::Result<()> {
        Ok(())
    }

    fn assemble(&self, _spec: &mut Spec) -> anyhow::Result<()> {
        Ok(())
    }

    fn link(&self, _spec: &mut Spec) -> anyhow::Result<()> {
        Ok(())
    }

    /// Run the body of `stage`.
    fn execute(&self, stage: Stage, spec: &mut Spec) -> anyhow::Result<()> {
        match stage {
            Stage::Prepare => self.prepare(spec),
            Stage::Compile => self.compile(spec),
            Stage::Assemble => self.assemble(spec),
            Stage::Link => self.link(spec),
        }
    }
}

/// A toolchain that only records that each stage ran.
///
/// Writes `prepare`, `compile`, `assemble` and `link` marker keys. The
/// `link` marker tells callers whether the pipeline reached its end.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullToolchain;

impl NullToolchain {
    fn mark(spec: &mut Spec, stage: Stage, value: &str) {
        spec.set(stage.name(), Value::from(value));
    }
}

impl Toolchain for NullToolchain {
    fn name(&self) -> &str {
        "null"
    }

    fn prepare(&self, spec: &mut Spec) -> anyhow::Result<()> {
        Self::mark(spec, Stage::Prepare, "prepared");
        Ok(())
    }

    fn compile(&self, spec: &mut Spec) -> anyhow::Result<()> {
        Self::mark(spec, Stage::Compile, "compiled");
        Ok(())
    }

    fn assemble(&self, spec: &mut Spec) -> anyhow::Result<()> {
        Self::mark(spec, Stage::Assemble, "assembled");
        Ok(())
    }

    fn link(&self, spec: &mut Spec) -> anyhow::Result<()> {
        Self::mark(spec, Stage::Link, "linked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_toolchain_marks_each_stage() {
        let toolchain = NullToolchain;
        let mut spec = Spec::new();
        for stage in Stage::ALL {
            toolchain.execute(stage, &mut spec).unwrap();
        }
        assert_eq!(spec.get_str("prepare"), Some("prepared"));
        assert_eq!(spec.get_str("compile"), Some("compiled"));
        assert_eq!(spec.get_str("assemble"), Some("assembled"));
        assert_eq!(spec.get_str("link"), Some("linked"));
    }
}
