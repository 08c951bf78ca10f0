//! External commands spawned per surviving event.
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

use crate::fsm::event::Event;

/// An error acting on the hook set.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HookError {
    #[error("hook {0} not found")]
    NotFound(String),
    #[error("hook {0} already exists")]
    Exists(String),
}

/// A named external command.
#[derive(Debug, Clone)]
pub struct Hook {
    pub name: String,
    pub path: PathBuf,
}

/// Named, ordered hook registry.
///
/// Hooks are fire-and-forget: the child's exit status and output are
/// ignored, and the engine never waits on it.
#[derive(Debug, Default)]
pub struct HookSet {
    hooks: Vec<Hook>,
}

impl HookSet {
    pub fn new(hooks: Vec<Hook>) -> Self {
        Self { hooks }
    }

    pub fn add(&mut self, name: &str, path: PathBuf) -> Result<(), HookError> {
        if self.hooks.iter().any(|hook| hook.name == name) {
            return Err(HookError::Exists(name.to_owned()));
        }
        self.hooks.push(Hook {
            name: name.to_owned(),
            path,
        });
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), HookError> {
        let before = self.hooks.len();
        self.hooks.retain(|hook| hook.name != name);

        if self.hooks.len() == before {
            return Err(HookError::NotFound(name.to_owned()));
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.iter().map(|hook| hook.name.as_str())
    }

    /// Spawn every hook with the event serialized as arguments.
    pub fn dispatch(&self, event: &Event) {
        for hook in &self.hooks {
            let mut command = Command::new(&hook.path);
            command
                .arg(event.kind().name())
                .args(event.fields())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());

            match command.spawn() {
                Ok(child) => {
                    debug!(target: "hooks", "{}: Spawned pid {}", hook.name, child.id());
                    // Not awaited; the daemon ignores SIGCHLD so the
                    // child does not linger as a zombie.
                    drop(child);
                }
                Err(err) => {
                    warn!(target: "hooks", "{}: Spawn failed: {}", hook.name, err);
                }
            }
        }
    }
}
