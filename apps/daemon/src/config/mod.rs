use config::Config;
use serde::Deserialize;

use std::collections::HashSet;
use std::path::PathBuf;

mod hook;
pub use hook::HookConfig;

mod logger;
pub use logger::LoggerConfig;

mod plugin;
pub use plugin::PluginConfig;

mod rule;
pub use rule::RuleConfig;

mod server;
pub use server::ServerSection;

mod transport;
pub use transport::TransportConfig;

/// Grace period between the QUIT round and hard exit, in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 5;

#[derive(Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub logger: LoggerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default, rename = "server")]
    pub servers: Vec<ServerSection>,

    #[serde(default, rename = "rule")]
    pub rules: Vec<RuleConfig>,

    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginConfig>,

    #[serde(default, rename = "hook")]
    pub hooks: Vec<HookConfig>,

    #[serde(default)]
    pub shutdown_timeout: Option<u64>,
}

impl DaemonConfig {
    pub fn from_path(path: PathBuf) -> eyre::Result<Self> {
        let config = Config::builder()
            .add_source(config::File::from(path))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    pub fn shutdown_timeout(&self) -> u64 {
        self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Duplicate ids anywhere are a fatal configuration error.
    fn validate(&self) -> eyre::Result<()> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id.as_str()) {
                eyre::bail!("duplicate server id: {}", server.id);
            }
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.id.as_str()) {
                eyre::bail!("duplicate plugin id: {}", plugin.id);
            }
        }

        let mut seen = HashSet::new();
        for hook in &self.hooks {
            if !seen.insert(hook.name.as_str()) {
                eyre::bail!("duplicate hook name: {}", hook.name);
            }
        }

        Ok(())
    }

    /// Assemble the engine-side configuration.
    pub fn to_engine_config(&self) -> eyre::Result<tern_engine::fsm::handler::Config> {
        Ok(tern_engine::fsm::handler::Config {
            servers: self
                .servers
                .iter()
                .map(ServerSection::to_server_config)
                .collect::<eyre::Result<Vec<_>>>()?,
            rules: self.rules.iter().map(RuleConfig::to_rule).collect(),
            hooks: self.hooks.iter().map(HookConfig::to_hook).collect(),
            plugins: self.plugins.iter().map(PluginConfig::to_spec).collect(),
            loaders: vec![Box::<tern_engine::fsm::plugins::StaticLoader>::default()],
            search_paths: Vec::new(),
        })
    }
}
