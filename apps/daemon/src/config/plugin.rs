use std::collections::BTreeMap;

use serde::Deserialize;

use tern_engine::fsm::handler::PluginSpec;

/// One `[[plugin]]` section.
#[derive(Deserialize)]
pub struct PluginConfig {
    pub id: String,

    #[serde(default)]
    pub options: BTreeMap<String, String>,

    #[serde(default)]
    pub templates: BTreeMap<String, String>,

    #[serde(default)]
    pub paths: BTreeMap<String, String>,
}

impl PluginConfig {
    pub fn to_spec(&self) -> PluginSpec {
        let mut spec = PluginSpec::new(self.id.clone());

        spec.options = self.options.clone().into_iter().collect();
        spec.templates = self.templates.clone().into_iter().collect();
        spec.paths = self.paths.clone().into_iter().collect();

        spec
    }
}
