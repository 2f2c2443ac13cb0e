//! Fakes shared by unit tests.

use crate::error::Error;
use crate::model::Account;
use crate::system::{CommandOutput, CommandRunner, CommandSpec};
use std::sync::{Mutex, PoisonError};

type Script = Box<dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync>;

/// A [`CommandRunner`] that answers from a closure and records every call.
pub struct ScriptedRunner {
    script: Script,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::default(),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(|_| CommandOutput::ok(""))
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Calls rendered as command lines, for terse assertions.
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, Error> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.clone());
        Ok((self.script)(spec))
    }
}

pub fn account() -> Account {
    Account {
        username: "alice".into(),
        uid: 1001,
        gid: 1001,
        home: "/home/alice".into(),
    }
}
