use serde::Deserialize;

use tern_engine::fsm::rules::{Rule, RuleAction};

/// One `[[rule]]` section.
#[derive(Deserialize)]
pub struct RuleConfig {
    #[serde(default, deserialize_with = "deserialize_action")]
    pub action: RuleActionConfig,

    #[serde(default)]
    pub servers: Vec<String>,

    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default)]
    pub origins: Vec<String>,

    #[serde(default)]
    pub plugins: Vec<String>,

    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Deserialize, Default, Clone, Copy)]
pub enum RuleActionConfig {
    #[default]
    Accept,
    Drop,
}

fn deserialize_action<'de, D>(deserializer: D) -> Result<RuleActionConfig, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;

    match s.as_str() {
        "accept" => Ok(RuleActionConfig::Accept),
        "drop" => Ok(RuleActionConfig::Drop),
        other => Err(serde::de::Error::custom(format!(
            "invalid rule action: {}",
            other
        ))),
    }
}

impl RuleConfig {
    pub fn to_rule(&self) -> Rule {
        let mut rule = Rule::new(match self.action {
            RuleActionConfig::Accept => RuleAction::Accept,
            RuleActionConfig::Drop => RuleAction::Drop,
        });

        rule.servers = self.servers.iter().cloned().collect();
        rule.channels = self.channels.iter().cloned().collect();
        rule.origins = self.origins.iter().cloned().collect();
        rule.plugins = self.plugins.iter().cloned().collect();
        rule.events = self.events.iter().cloned().collect();

        rule
    }
}
