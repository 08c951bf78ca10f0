use std::path::PathBuf;

use serde::Deserialize;

use tern_engine::fsm::hooks::Hook;

/// One `[[hook]]` section.
#[derive(Deserialize)]
pub struct HookConfig {
    pub name: String,
    pub path: PathBuf,
}

impl HookConfig {
    pub fn to_hook(&self) -> Hook {
        Hook {
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }
}
