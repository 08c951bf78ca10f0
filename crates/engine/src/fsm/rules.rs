//! Ordered accept/drop filter over dispatched events.
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use tern_proto::nick_of;

/// An error mutating the rule chain.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RuleError {
    #[error("index out of range")]
    OutOfRange,
    #[error("invalid action")]
    InvalidAction,
    #[error("invalid rule criterion")]
    InvalidCriterion,
}

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Accept,
    Drop,
}

impl FromStr for RuleAction {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            _ => Err(RuleError::InvalidAction),
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("accept"),
            Self::Drop => f.write_str("drop"),
        }
    }
}

/// One filter entry. An empty criteria set matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: RuleAction,
    pub servers: BTreeSet<String>,
    pub channels: BTreeSet<String>,
    pub origins: BTreeSet<String>,
    pub plugins: BTreeSet<String>,
    pub events: BTreeSet<String>,
}

impl Rule {
    pub fn new(action: RuleAction) -> Self {
        Self {
            action,
            servers: BTreeSet::new(),
            channels: BTreeSet::new(),
            origins: BTreeSet::new(),
            plugins: BTreeSet::new(),
            events: BTreeSet::new(),
        }
    }

    /// The criteria set selected by its wire key (`s`, `c`, `o`, `p`,
    /// `e`), as used by RULE-ADD and RULE-EDIT.
    pub fn set_mut(&mut self, key: char) -> Option<&mut BTreeSet<String>> {
        match key {
            's' => Some(&mut self.servers),
            'c' => Some(&mut self.channels),
            'o' => Some(&mut self.origins),
            'p' => Some(&mut self.plugins),
            'e' => Some(&mut self.events),
            _ => None,
        }
    }

    fn matches(
        &self,
        server: &str,
        channel: Option<&str>,
        origin: Option<&str>,
        plugin: Option<&str>,
        event: &str,
    ) -> bool {
        fn member(set: &BTreeSet<String>, value: Option<&str>) -> bool {
            set.is_empty() || value.is_some_and(|v| set.contains(v))
        }

        member(&self.servers, Some(server))
            && member(&self.channels, channel)
            && member(&self.origins, origin.map(nick_of))
            && member(&self.plugins, plugin)
            && member(&self.events, Some(event))
    }
}

/// The ordered rule sequence; position is significant and visible on
/// the control socket.
#[derive(Debug, Clone, Default)]
pub struct RuleChain {
    rules: Vec<Rule>,
}

impl RuleChain {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Append, or insert at `position` when given.
    pub fn add(&mut self, rule: Rule, position: Option<usize>) -> Result<(), RuleError> {
        match position {
            Some(position) if position > self.rules.len() => Err(RuleError::OutOfRange),
            Some(position) => {
                self.rules.insert(position, rule);
                Ok(())
            }
            None => {
                self.rules.push(rule);
                Ok(())
            }
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Rule, RuleError> {
        self.rules.get_mut(index).ok_or(RuleError::OutOfRange)
    }

    pub fn remove(&mut self, index: usize) -> Result<(), RuleError> {
        if index >= self.rules.len() {
            return Err(RuleError::OutOfRange);
        }
        self.rules.remove(index);
        Ok(())
    }

    /// Reorder one rule. The destination is clamped to the end, so
    /// moving `from` to `to` and back restores the original order.
    pub fn move_rule(&mut self, from: usize, to: usize) -> Result<(), RuleError> {
        if from >= self.rules.len() {
            return Err(RuleError::OutOfRange);
        }
        let rule = self.rules.remove(from);
        let to = to.min(self.rules.len());
        self.rules.insert(to, rule);
        Ok(())
    }

    /// Decide whether an event reaches a plugin.
    ///
    /// Rules are scanned in order; the last matching rule wins and the
    /// implicit default is accept. Pure: no state is touched.
    pub fn evaluate(
        &self,
        server: &str,
        channel: Option<&str>,
        origin: Option<&str>,
        plugin: Option<&str>,
        event: &str,
    ) -> RuleAction {
        self.rules
            .iter()
            .filter(|rule| rule.matches(server, channel, origin, plugin, event))
            .last()
            .map(|rule| rule.action)
            .unwrap_or(RuleAction::Accept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    fn rule(action: RuleAction, with: &[(char, &str)]) -> Rule {
        let mut rule = Rule::new(action);
        for (key, value) in with {
            rule.set_mut(*key).unwrap().insert((*value).to_owned());
        }
        rule
    }

    #[test]
    fn empty_chain_accepts() {
        let chain = RuleChain::default();

        assert_eq!(
            chain.evaluate("irc", Some("#room"), Some("alice"), Some("echo"), "message"),
            RuleAction::Accept
        );
    }

    #[test]
    fn empty_rule_matches_everything() {
        let chain = RuleChain::new(vec![rule(RuleAction::Drop, &[])]);

        assert_eq!(
            chain.evaluate("any", None, None, None, "connect"),
            RuleAction::Drop
        );
    }

    #[test]
    fn last_matching_rule_wins() {
        let chain = RuleChain::new(vec![
            rule(RuleAction::Drop, &[('c', "#staff")]),
            rule(RuleAction::Accept, &[('c', "#staff"), ('p', "logger")]),
        ]);

        // Blanket drop for #staff, carved back out for one plugin.
        assert_eq!(
            chain.evaluate("irc", Some("#staff"), Some("alice"), Some("logger"), "message"),
            RuleAction::Accept
        );
        assert_eq!(
            chain.evaluate("irc", Some("#staff"), Some("alice"), Some("echo"), "message"),
            RuleAction::Drop
        );
    }

    #[test]
    fn origin_matching_strips_user_and_host() {
        let chain = RuleChain::new(vec![rule(RuleAction::Drop, &[('o', "spammer")])]);

        assert_eq!(
            chain.evaluate("irc", Some("#room"), Some("spammer!u@h"), None, "message"),
            RuleAction::Drop
        );
    }

    #[test]
    fn channel_criterion_skips_channelless_events() {
        let chain = RuleChain::new(vec![rule(RuleAction::Drop, &[('c', "#room")])]);

        assert_eq!(
            chain.evaluate("irc", None, None, None, "connect"),
            RuleAction::Accept
        );
    }

    #[test]
    fn move_is_involutive() {
        let mut chain = RuleChain::new(vec![
            rule(RuleAction::Accept, &[('s', "a")]),
            rule(RuleAction::Drop, &[('s', "b")]),
            rule(RuleAction::Accept, &[('s', "c")]),
        ]);
        let original: Vec<Rule> = chain.iter().cloned().collect();

        chain.move_rule(0, 2).unwrap();
        chain.move_rule(2, 0).unwrap();

        assert_eq!(chain.iter().cloned().collect::<Vec<_>>(), original);
    }

    #[test]
    fn mutations_check_bounds() {
        let mut chain = RuleChain::default();

        assert_eq!(chain.remove(0), Err(RuleError::OutOfRange));
        assert_eq!(chain.move_rule(1, 0), Err(RuleError::OutOfRange));
        assert_eq!(
            chain.add(Rule::new(RuleAction::Accept), Some(3)),
            Err(RuleError::OutOfRange)
        );
        assert!(chain.add(Rule::new(RuleAction::Accept), Some(0)).is_ok());
    }

    quickcheck! {
        fn evaluation_is_pure(server: String, channel: Option<String>, origin: Option<String>, event: String) -> bool {
            let chain = RuleChain::new(vec![
                rule(RuleAction::Drop, &[('c', "#a")]),
                rule(RuleAction::Accept, &[('o', "bob")]),
                rule(RuleAction::Drop, &[('e', "message")]),
            ]);

            let first = chain.evaluate(&server, channel.as_deref(), origin.as_deref(), None, &event);
            let second = chain.evaluate(&server, channel.as_deref(), origin.as_deref(), None, &event);

            first == second
        }
    }
}
