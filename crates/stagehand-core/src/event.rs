//! Toolchain stages and the advice events dispatched around them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The four toolchain stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Compile,
    Assemble,
    Link,
}

impl Stage {
    /// All stages in the fixed execution order.
    pub const ALL: [Stage; 4] = [Stage::Prepare, Stage::Compile, Stage::Assemble, Stage::Link];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Prepare => "prepare",
            Stage::Compile => "compile",
            Stage::Assemble => "assemble",
            Stage::Link => "link",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A named dispatch point that advices can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Event {
    /// Fired before a stage body runs.
    Before(Stage),

    /// Fired after a stage body returned successfully.
    After(Stage),

    /// Fired by the runner advice right before the external process starts.
    BeforeKarma,

    /// Fired by the runner advice once the outcome is recorded.
    AfterKarma,

    /// Fired once after the stages, on every exit path.
    Cleanup,
}

impl Event {
    pub fn name(&self) -> String {
        match self {
            Event::Before(stage) => format!("before_{}", stage),
            Event::After(stage) => format!("after_{}", stage),
            Event::BeforeKarma => "before_karma".to_string(),
            Event::AfterKarma => "after_karma".to_string(),
            Event::Cleanup => "cleanup".to_string(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Event {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before_karma" => return Ok(Event::BeforeKarma),
            "after_karma" => return Ok(Event::AfterKarma),
            "cleanup" => return Ok(Event::Cleanup),
            _ => {}
        }

        let (prefix, stage) = s.split_once('_').ok_or_else(|| s.to_string())?;
        let stage = Stage::ALL
            .into_iter()
            .find(|candidate| candidate.name() == stage)
            .ok_or_else(|| s.to_string())?;

        match prefix {
            "before" => Ok(Event::Before(stage)),
            "after" => Ok(Event::After(stage)),
            _ => Err(s.to_string()),
        }
    }
}

impl TryFrom<String> for Event {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Event> for String {
    fn from(event: Event) -> Self {
        event.name()
    }
}
