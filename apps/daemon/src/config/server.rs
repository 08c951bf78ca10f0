use std::collections::HashMap;

use serde::Deserialize;

use tern_engine::fsm::servers::{self, AutoJoin, ServerConfig};
use tern_engine::net::LocalDuration;

/// One `[[server]]` section.
#[derive(Deserialize)]
pub struct ServerSection {
    pub id: String,
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: bool,

    #[serde(default)]
    pub password: Option<String>,

    pub nickname: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub realname: Option<String>,

    #[serde(default = "default_prefix")]
    pub prefix: char,

    #[serde(default)]
    pub channels: Vec<ChannelEntry>,

    /// CTCP keyword replies; `VERSION` is answered by default.
    #[serde(default)]
    pub ctcp: HashMap<String, String>,

    #[serde(default)]
    pub auto_rejoin: bool,

    #[serde(default)]
    pub join_invite: bool,

    /// Outbound lines per second.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// First reconnection delay, in seconds.
    #[serde(default)]
    pub reconnect_base: Option<u64>,

    /// Reconnection delay ceiling, in seconds.
    #[serde(default)]
    pub reconnect_cap: Option<u64>,

    /// Give up reconnecting after this many consecutive failures.
    #[serde(default)]
    pub reconnect_tries: Option<u32>,
}

/// A channel to join, optionally locked.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum ChannelEntry {
    Name(String),
    WithPassword { name: String, password: String },
}

fn default_port() -> u16 {
    6667
}

fn default_prefix() -> char {
    '!'
}

fn default_rate_limit() -> u32 {
    servers::DEFAULT_RATE_LIMIT
}

impl ServerSection {
    pub fn to_server_config(&self) -> eyre::Result<ServerConfig> {
        let mut config = ServerConfig::new(
            self.id.clone(),
            self.host.clone(),
            self.port,
            self.nickname.clone(),
            self.username.clone().unwrap_or_else(|| self.nickname.clone()),
            self.realname.clone().unwrap_or_else(|| self.nickname.clone()),
        );

        config.tls = self.tls;
        config.password = self.password.clone();
        config.prefix = self.prefix;
        config.auto_rejoin = self.auto_rejoin;
        config.join_invite = self.join_invite;
        config.rate_limit = self.rate_limit;
        config.reconnect_tries = self.reconnect_tries;

        if let Some(secs) = self.reconnect_base {
            config.reconnect_base = LocalDuration::from_secs(secs);
        }
        if let Some(secs) = self.reconnect_cap {
            config.reconnect_cap = LocalDuration::from_secs(secs);
        }

        config.channels = self
            .channels
            .iter()
            .map(|entry| match entry {
                ChannelEntry::Name(name) => AutoJoin {
                    name: name.clone(),
                    password: None,
                },
                ChannelEntry::WithPassword { name, password } => AutoJoin {
                    name: name.clone(),
                    password: Some(password.clone()),
                },
            })
            .collect();

        config.ctcp.insert(
            "VERSION".to_owned(),
            format!("ternd {}", env!("CARGO_PKG_VERSION")),
        );
        for (keyword, reply) in &self.ctcp {
            config
                .ctcp
                .insert(keyword.to_ascii_uppercase(), reply.clone());
        }

        Ok(config)
    }
}
