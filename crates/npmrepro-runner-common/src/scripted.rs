//! A fake [`CommandRunner`] for decision-logic tests.
//!
//! Handlers are matched against the rendered command line by prefix, in registration
//! order. Every invocation is recorded so tests can assert which steps ran.

use std::sync::Mutex;

use anyhow::Result;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};

type Respond = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync>;

pub struct ScriptedRunner {
    handlers: Vec<(String, Respond)>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on<F>(mut self, prefix: &str, respond: F) -> Self
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        self.handlers.push((prefix.to_string(), Box::new(respond)));
        self
    }

    /// Shorthand for a handler that always returns the same output.
    pub fn on_output(self, prefix: &str, output: CommandOutput) -> Self {
        self.on(prefix, move |_| Ok(output.clone()))
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .map(|g| g.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::command_line).collect()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.command_lines().iter().any(|l| l.starts_with(prefix))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        if let Ok(mut guard) = self.calls.lock() {
            guard.push(cmd.clone());
        }
        let line = cmd.command_line();
        for (prefix, respond) in &self.handlers {
            if line.starts_with(prefix.as_str()) {
                return respond(cmd);
            }
        }
        Ok(CommandOutput::failed(
            127,
            format!("unscripted command: {line}"),
        ))
    }
}
