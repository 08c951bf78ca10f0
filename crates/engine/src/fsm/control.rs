//! Control-socket peers and verb dispatch.
//!
//! The protocol is ASCII and line-based. Every verb is answered with
//! `OK`, `OK <count>` followed by a payload, or `ERROR <message>`;
//! errors never close the connection. The last positional argument of
//! a verb may contain spaces when the verb's arity says it is final.
use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::common::time::TickClock;
use crate::fsm::handler::StateMachine;
use crate::fsm::plugins::MapKind;
use crate::fsm::rules::{Rule, RuleAction, RuleError};
use crate::fsm::servers::ServerConfig;
use crate::net::PeerId;

type Reply = Result<String, String>;

/// Accepted control connections and their watch flags.
#[derive(Debug, Default)]
pub struct Peers {
    watching: HashMap<PeerId, bool>,
}

impl Peers {
    pub fn insert(&mut self, peer: PeerId) {
        self.watching.insert(peer, false);
    }

    pub fn remove(&mut self, peer: PeerId) {
        self.watching.remove(&peer);
    }

    pub fn set_watching(&mut self, peer: PeerId) {
        if let Some(flag) = self.watching.get_mut(&peer) {
            *flag = true;
        }
    }

    /// Peers subscribed to event broadcast, in stable order.
    pub fn watching(&self) -> Vec<PeerId> {
        let mut watchers: Vec<PeerId> = self
            .watching
            .iter()
            .filter(|(_, watching)| **watching)
            .map(|(peer, _)| *peer)
            .collect();
        watchers.sort_unstable();
        watchers
    }
}

/// Split up to `max` space-separated arguments; the last one swallows
/// the remainder of the line.
fn split_args(rest: &str, max: usize) -> Vec<&str> {
    let mut args = Vec::new();
    let mut rest = rest.trim_start_matches(' ');

    while !rest.is_empty() && args.len() + 1 < max {
        match rest.find(' ') {
            Some(i) => {
                args.push(&rest[..i]);
                rest = rest[i..].trim_start_matches(' ');
            }
            None => {
                args.push(rest);
                rest = "";
            }
        }
    }
    if !rest.is_empty() && args.len() < max {
        args.push(rest);
    }
    args
}

fn ok() -> Reply {
    Ok("OK".to_owned())
}

impl<C: TickClock> StateMachine<C> {
    /// Handle one line from a control peer.
    pub fn control_line(&mut self, peer: PeerId, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        debug!(target: "control", "#{}: {}", peer, line);

        let (verb, rest) = match line.find(' ') {
            Some(i) => (&line[..i], line[i..].trim_start_matches(' ')),
            None => (line, ""),
        };

        let reply = match verb {
            "HOOK-ADD" => self.cmd_hook_add(rest),
            "HOOK-LIST" => self.cmd_hook_list(),
            "HOOK-REMOVE" => self.cmd_hook_remove(rest),
            "PLUGIN-CONFIG" => self.cmd_plugin_kv(rest, MapKind::Options),
            "PLUGIN-INFO" => self.cmd_plugin_info(rest),
            "PLUGIN-LIST" => self.cmd_plugin_list(),
            "PLUGIN-LOAD" => self.cmd_plugin_load(rest),
            "PLUGIN-PATH" => self.cmd_plugin_kv(rest, MapKind::Paths),
            "PLUGIN-RELOAD" => self.cmd_plugin_reload(rest),
            "PLUGIN-TEMPLATE" => self.cmd_plugin_kv(rest, MapKind::Templates),
            "PLUGIN-UNLOAD" => self.cmd_plugin_unload(rest),
            "RULE-ADD" => self.cmd_rule_add(rest),
            "RULE-EDIT" => self.cmd_rule_edit(rest),
            "RULE-LIST" => self.cmd_rule_list(),
            "RULE-MOVE" => self.cmd_rule_move(rest),
            "RULE-REMOVE" => self.cmd_rule_remove(rest),
            "SERVER-CONNECT" => self.cmd_server_connect(rest),
            "SERVER-DISCONNECT" => self.cmd_server_disconnect(rest),
            "SERVER-INFO" => self.cmd_server_info(rest),
            "SERVER-INVITE" => self.cmd_server_invite(rest),
            "SERVER-JOIN" => self.cmd_server_join(rest),
            "SERVER-KICK" => self.cmd_server_kick(rest),
            "SERVER-LIST" => self.cmd_server_list(),
            "SERVER-ME" => self.cmd_server_me(rest),
            "SERVER-MESSAGE" => self.cmd_server_message(rest),
            "SERVER-MODE" => self.cmd_server_mode(rest),
            "SERVER-NOTICE" => self.cmd_server_notice(rest),
            "SERVER-PART" => self.cmd_server_part(rest),
            "SERVER-RECONNECT" => self.cmd_server_reconnect(rest),
            "SERVER-TOPIC" => self.cmd_server_topic(rest),
            "WATCH" => {
                self.peers.set_watching(peer);
                ok()
            }
            _ => Err("command not found".to_owned()),
        };

        match reply {
            Ok(payload) => self.outbox.peer_line(peer, &payload),
            Err(message) => self.outbox.peer_line(peer, &format!("ERROR {}", message)),
        }
        self.flush();
    }

    fn cmd_hook_add(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 2);
        let [name, path] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        self.hooks
            .add(name, PathBuf::from(path))
            .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_hook_list(&self) -> Reply {
        let names: Vec<&str> = self.hooks.names().collect();

        if names.is_empty() {
            ok()
        } else {
            Ok(format!("OK {}", names.join(" ")))
        }
    }

    fn cmd_hook_remove(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 1);
        let [name] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        self.hooks.remove(name).map_err(|err| err.to_string())?;
        ok()
    }

    /// Shared shape of PLUGIN-CONFIG, PLUGIN-PATH and PLUGIN-TEMPLATE:
    /// get, set or list one of the three maps.
    fn cmd_plugin_kv(&mut self, rest: &str, map: MapKind) -> Reply {
        let args = split_args(rest, 3);

        match args[..] {
            [id, key, value] => {
                let plugin = self
                    .plugins
                    .get_mut(id)
                    .map_err(|err| err.to_string())?;
                plugin.set(map, key, value);
                ok()
            }
            [id, key] => {
                let plugin = self.plugins.get(id).map_err(|err| err.to_string())?;
                match plugin.get(map, key) {
                    Some(value) => Ok(format!("OK 1\n{}", value)),
                    None => Err("key not found".to_owned()),
                }
            }
            [id] => {
                let plugin = self.plugins.get(id).map_err(|err| err.to_string())?;
                let keys = plugin.keys(map);

                let mut out = format!("OK {}", keys.len());
                for key in keys {
                    let value = plugin.get(map, &key).unwrap_or_default();
                    out.push('\n');
                    out.push_str(&format!("{}={}", key, value));
                }
                Ok(out)
            }
            _ => Err("invalid arguments".to_owned()),
        }
    }

    fn cmd_plugin_info(&self, rest: &str) -> Reply {
        let args = split_args(rest, 1);
        let [id] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        let plugin = self.plugins.get(id).map_err(|err| err.to_string())?;
        let metadata = plugin.metadata();

        Ok(format!(
            "OK {}\n{}\n{}\n{}\n{}",
            id, metadata.summary, metadata.version, metadata.license, metadata.author,
        ))
    }

    fn cmd_plugin_list(&self) -> Reply {
        let ids: Vec<&str> = self.plugins.ids().map(String::as_str).collect();

        if ids.is_empty() {
            ok()
        } else {
            Ok(format!("OK {}", ids.join(" ")))
        }
    }

    fn cmd_plugin_load(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 1);
        let [id] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        self.plugin_load(id).map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_plugin_reload(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 1);

        match args[..] {
            [id] => {
                self.plugin_reload(id).map_err(|err| err.to_string())?;
            }
            _ => {
                for id in self.plugins.ids().cloned().collect::<Vec<_>>() {
                    self.plugin_reload(&id).ok();
                }
            }
        }
        ok()
    }

    fn cmd_plugin_unload(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 1);

        match args[..] {
            [id] => {
                self.plugin_unload(id).map_err(|err| err.to_string())?;
            }
            _ => {
                for id in self.plugins.ids().cloned().collect::<Vec<_>>() {
                    self.plugin_unload(&id).ok();
                }
            }
        }
        ok()
    }

    fn cmd_rule_add(&mut self, rest: &str) -> Reply {
        let mut tokens = rest.split_ascii_whitespace();
        let action: RuleAction = tokens
            .next()
            .ok_or_else(|| "invalid arguments".to_owned())?
            .parse()
            .map_err(|err: RuleError| err.to_string())?;

        let mut rule = Rule::new(action);
        let mut index = None;

        for token in tokens {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| "invalid rule criterion".to_owned())?;

            match key {
                "i" => {
                    index = Some(value.parse::<usize>().map_err(|_| "invalid index".to_owned())?);
                }
                _ if key.len() == 1 => {
                    let set = rule
                        .set_mut(key.chars().next().expect("length checked"))
                        .ok_or_else(|| "invalid rule criterion".to_owned())?;
                    set.insert(value.to_owned());
                }
                _ => return Err("invalid rule criterion".to_owned()),
            }
        }

        self.rules
            .add(rule, index)
            .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_rule_edit(&mut self, rest: &str) -> Reply {
        let mut tokens = rest.split_ascii_whitespace();
        let index: usize = tokens
            .next()
            .ok_or_else(|| "invalid arguments".to_owned())?
            .parse()
            .map_err(|_| "invalid index".to_owned())?;

        let rule = self.rules.get_mut(index).map_err(|err| err.to_string())?;

        for token in tokens {
            let mut chars = token.chars();
            let (Some(key), Some(attr)) = (chars.next(), chars.next()) else {
                return Err("invalid rule criterion".to_owned());
            };
            let value = chars.as_str();

            match (key, attr) {
                ('a', '=') => {
                    rule.action = value.parse().map_err(|err: RuleError| err.to_string())?;
                }
                (key, '+') => {
                    let set = rule
                        .set_mut(key)
                        .ok_or_else(|| "invalid rule criterion".to_owned())?;
                    set.insert(value.to_owned());
                }
                (key, '-') => {
                    let set = rule
                        .set_mut(key)
                        .ok_or_else(|| "invalid rule criterion".to_owned())?;
                    set.remove(value);
                }
                _ => return Err("invalid rule criterion".to_owned()),
            }
        }
        ok()
    }

    fn cmd_rule_list(&self) -> Reply {
        let mut out = format!("OK {}", self.rules.len());

        for rule in self.rules.iter() {
            out.push('\n');
            out.push_str(&rule.action.to_string());
            for set in [
                &rule.servers,
                &rule.channels,
                &rule.origins,
                &rule.plugins,
                &rule.events,
            ] {
                out.push('\n');
                out.push_str(&set.iter().cloned().collect::<Vec<_>>().join(" "));
            }
        }
        Ok(out)
    }

    fn cmd_rule_move(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 2);
        let [from, to] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        let from: usize = from.parse().map_err(|_| "invalid index".to_owned())?;
        let to: usize = to.parse().map_err(|_| "invalid index".to_owned())?;

        self.rules
            .move_rule(from, to)
            .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_rule_remove(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 1);
        let [index] = args[..] else {
            return Err("invalid arguments".to_owned());
        };
        let index: usize = index.parse().map_err(|_| "invalid index".to_owned())?;

        self.rules.remove(index).map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_connect(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 6);
        let [id, host, port, nickname, username, realname] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        if self.servers.contains(&id.to_owned()) {
            return Err(format!("server {} already exists", id));
        }

        // A leading `+` on the port selects TLS.
        let (tls, port) = match port.strip_prefix('+') {
            Some(port) => (true, port),
            None => (false, port),
        };
        let port: u16 = port.parse().map_err(|_| "invalid port".to_owned())?;

        let mut config = ServerConfig::new(id, host, port, nickname, username, realname);
        config.tls = tls;

        self.servers.add(config).map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_disconnect(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 1);

        match args[..] {
            [id] => {
                let id = id.to_owned();
                if !self.servers.contains(&id) {
                    return Err(format!("server {} not found", id));
                }
                self.remove_server(&id);
            }
            _ => {
                for id in self.server_ids() {
                    self.remove_server(&id);
                }
            }
        }
        ok()
    }

    fn cmd_server_info(&self, rest: &str) -> Reply {
        let args = split_args(rest, 1);
        let [id] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        let server = self
            .servers
            .get(&id.to_owned())
            .map_err(|err| err.to_string())?;

        let mut out = format!("OK {}\n", id);
        out.push_str(&format!(
            "{} {}{}\n",
            server.config.host,
            server.config.port,
            if server.config.tls { " ssl" } else { "" },
        ));
        out.push_str(&format!(
            "{} {} {}\n",
            server.nickname, server.config.username, server.config.realname,
        ));

        let channels: Vec<String> = server
            .channels
            .iter()
            .map(|(name, channel)| {
                // Our own modes on the channel, as prefix symbols.
                let modes = channel
                    .users
                    .get(&server.nickname)
                    .map(|mask| server.isupport.prefix.symbols(*mask))
                    .unwrap_or_default();

                if channel.joined {
                    format!("{}{}", modes, name)
                } else {
                    format!("{}({})", modes, name)
                }
            })
            .collect();
        out.push_str(&channels.join(" "));

        Ok(out)
    }

    fn cmd_server_invite(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 3);
        let [id, channel, target] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        self.servers
            .invite(&id.to_owned(), channel, target)
            .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_join(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 3);

        match args[..] {
            [id, channel] => self.servers.join(&id.to_owned(), channel, None),
            [id, channel, password] => {
                self.servers.join(&id.to_owned(), channel, Some(password))
            }
            _ => return Err("invalid arguments".to_owned()),
        }
        .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_kick(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 4);

        match args[..] {
            [id, channel, target] => self.servers.kick(&id.to_owned(), channel, target, None),
            [id, channel, target, reason] => {
                self.servers
                    .kick(&id.to_owned(), channel, target, Some(reason))
            }
            _ => return Err("invalid arguments".to_owned()),
        }
        .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_list(&self) -> Reply {
        let ids = self.server_ids();

        if ids.is_empty() {
            ok()
        } else {
            Ok(format!("OK {}", ids.join(" ")))
        }
    }

    fn cmd_server_me(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 3);
        let [id, target, message] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        self.servers
            .me(&id.to_owned(), target, message)
            .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_message(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 3);
        let [id, target, message] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        self.servers
            .message(&id.to_owned(), target, message)
            .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_mode(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 4);

        match args[..] {
            [id, channel, mode] => self.servers.mode(&id.to_owned(), channel, mode, None),
            [id, channel, mode, mode_args] => {
                self.servers
                    .mode(&id.to_owned(), channel, mode, Some(mode_args))
            }
            _ => return Err("invalid arguments".to_owned()),
        }
        .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_notice(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 3);
        let [id, target, message] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        self.servers
            .notice(&id.to_owned(), target, message)
            .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_part(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 3);

        match args[..] {
            [id, channel] => self.servers.part(&id.to_owned(), channel, None),
            [id, channel, reason] => self.servers.part(&id.to_owned(), channel, Some(reason)),
            _ => return Err("invalid arguments".to_owned()),
        }
        .map_err(|err| err.to_string())?;
        ok()
    }

    fn cmd_server_reconnect(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 1);

        match args[..] {
            [id] => {
                self.servers
                    .reconnect(&id.to_owned())
                    .map_err(|err| err.to_string())?;
            }
            _ => {
                for id in self.server_ids() {
                    self.servers.reconnect(&id).ok();
                }
            }
        }
        ok()
    }

    fn cmd_server_topic(&mut self, rest: &str) -> Reply {
        let args = split_args(rest, 3);
        let [id, channel, topic] = args[..] else {
            return Err("invalid arguments".to_owned());
        };

        self.servers
            .topic(&id.to_owned(), channel, topic)
            .map_err(|err| err.to_string())?;
        ok()
    }
}
