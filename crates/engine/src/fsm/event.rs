//! High-level IRC events and their control-socket serialization.
use std::fmt;

use crate::net::ServerId;

/// Accumulated WHOIS information, flushed as one event on the 318
/// terminator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whois {
    pub nick: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub server: String,
    pub idle: u64,
    pub channels: Vec<String>,
}

/// A semantically complete happening on one server.
///
/// Produced by the server state machine from one or more inbound
/// lines, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Registration completed (001 received).
    Connect { server: ServerId },
    /// The transport went away.
    Disconnect { server: ServerId },
    /// PRIVMSG to a channel or to us.
    Message {
        server: ServerId,
        origin: String,
        channel: String,
        message: String,
    },
    /// NOTICE.
    Notice {
        server: ServerId,
        origin: String,
        message: String,
    },
    /// CTCP ACTION.
    Me {
        server: ServerId,
        origin: String,
        channel: String,
        message: String,
    },
    Join {
        server: ServerId,
        origin: String,
        channel: String,
    },
    Part {
        server: ServerId,
        origin: String,
        channel: String,
        reason: String,
    },
    Kick {
        server: ServerId,
        origin: String,
        channel: String,
        target: String,
        reason: String,
    },
    Invite {
        server: ServerId,
        origin: String,
        channel: String,
        target: String,
    },
    Mode {
        server: ServerId,
        origin: String,
        channel: String,
        mode: String,
        args: Vec<String>,
    },
    Nick {
        server: ServerId,
        origin: String,
        nickname: String,
    },
    Topic {
        server: ServerId,
        origin: String,
        channel: String,
        topic: String,
    },
    /// Batched NAMES listing (353 pages, flushed on 366).
    Names {
        server: ServerId,
        channel: String,
        nicknames: Vec<String>,
    },
    /// Batched WHOIS reply (flushed on 318).
    Whois { server: ServerId, whois: Whois },
    /// A message whose text addressed a loaded plugin through the
    /// server's command prefix. Synthesized by the dispatcher.
    Command {
        server: ServerId,
        origin: String,
        channel: String,
        plugin: String,
        body: String,
    },
}

/// Discriminant of an [`Event`]; also the vocabulary of the rule
/// chain's event sets and the leading verb of broadcast records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Message,
    Notice,
    Me,
    Join,
    Part,
    Kick,
    Invite,
    Mode,
    Nick,
    Topic,
    Names,
    Whois,
    Command,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Message => "message",
            Self::Notice => "notice",
            Self::Me => "me",
            Self::Join => "join",
            Self::Part => "part",
            Self::Kick => "kick",
            Self::Invite => "invite",
            Self::Mode => "mode",
            Self::Nick => "nick",
            Self::Topic => "topic",
            Self::Names => "names",
            Self::Whois => "whois",
            Self::Command => "command",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Event {
    /// The server this event originated on.
    pub fn server(&self) -> &ServerId {
        match self {
            Self::Connect { server }
            | Self::Disconnect { server }
            | Self::Message { server, .. }
            | Self::Notice { server, .. }
            | Self::Me { server, .. }
            | Self::Join { server, .. }
            | Self::Part { server, .. }
            | Self::Kick { server, .. }
            | Self::Invite { server, .. }
            | Self::Mode { server, .. }
            | Self::Nick { server, .. }
            | Self::Topic { server, .. }
            | Self::Names { server, .. }
            | Self::Whois { server, .. }
            | Self::Command { server, .. } => server,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect { .. } => EventKind::Connect,
            Self::Disconnect { .. } => EventKind::Disconnect,
            Self::Message { .. } => EventKind::Message,
            Self::Notice { .. } => EventKind::Notice,
            Self::Me { .. } => EventKind::Me,
            Self::Join { .. } => EventKind::Join,
            Self::Part { .. } => EventKind::Part,
            Self::Kick { .. } => EventKind::Kick,
            Self::Invite { .. } => EventKind::Invite,
            Self::Mode { .. } => EventKind::Mode,
            Self::Nick { .. } => EventKind::Nick,
            Self::Topic { .. } => EventKind::Topic,
            Self::Names { .. } => EventKind::Names,
            Self::Whois { .. } => EventKind::Whois,
            Self::Command { .. } => EventKind::Command,
        }
    }

    /// Channel the event concerns, when it concerns one.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Message { channel, .. }
            | Self::Me { channel, .. }
            | Self::Join { channel, .. }
            | Self::Part { channel, .. }
            | Self::Kick { channel, .. }
            | Self::Invite { channel, .. }
            | Self::Mode { channel, .. }
            | Self::Topic { channel, .. }
            | Self::Names { channel, .. }
            | Self::Command { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Origin nickname, when the event has one.
    pub fn origin(&self) -> Option<&str> {
        match self {
            Self::Message { origin, .. }
            | Self::Notice { origin, .. }
            | Self::Me { origin, .. }
            | Self::Join { origin, .. }
            | Self::Part { origin, .. }
            | Self::Kick { origin, .. }
            | Self::Invite { origin, .. }
            | Self::Mode { origin, .. }
            | Self::Nick { origin, .. }
            | Self::Topic { origin, .. }
            | Self::Command { origin, .. } => Some(origin),
            _ => None,
        }
    }

    /// Raw record fields after the kind verb, unquoted.
    pub fn fields(&self) -> Vec<String> {
        match self {
            Self::Connect { server } | Self::Disconnect { server } => vec![server.clone()],
            Self::Message {
                server,
                origin,
                channel,
                message,
            }
            | Self::Me {
                server,
                origin,
                channel,
                message,
            } => {
                vec![server.clone(), origin.clone(), channel.clone(), message.clone()]
            }
            Self::Notice {
                server,
                origin,
                message,
            } => vec![server.clone(), origin.clone(), message.clone()],
            Self::Join {
                server,
                origin,
                channel,
            } => vec![server.clone(), origin.clone(), channel.clone()],
            Self::Part {
                server,
                origin,
                channel,
                reason,
            } => vec![server.clone(), origin.clone(), channel.clone(), reason.clone()],
            Self::Kick {
                server,
                origin,
                channel,
                target,
                reason,
            } => vec![
                server.clone(),
                origin.clone(),
                channel.clone(),
                target.clone(),
                reason.clone(),
            ],
            Self::Invite {
                server,
                origin,
                channel,
                target,
            } => vec![
                server.clone(),
                origin.clone(),
                channel.clone(),
                target.clone(),
            ],
            Self::Mode {
                server,
                origin,
                channel,
                mode,
                args,
            } => {
                let mut fields = vec![server.clone(), origin.clone(), channel.clone(), mode.clone()];
                fields.extend(args.iter().cloned());
                fields
            }
            Self::Nick {
                server,
                origin,
                nickname,
            } => vec![server.clone(), origin.clone(), nickname.clone()],
            Self::Topic {
                server,
                origin,
                channel,
                topic,
            } => vec![server.clone(), origin.clone(), channel.clone(), topic.clone()],
            Self::Names {
                server,
                channel,
                nicknames,
            } => {
                let mut fields = vec![server.clone(), channel.clone()];
                fields.extend(nicknames.iter().cloned());
                fields
            }
            Self::Whois { server, whois } => {
                let mut fields = vec![
                    server.clone(),
                    whois.nick.clone(),
                    whois.user.clone(),
                    whois.host.clone(),
                    whois.realname.clone(),
                ];
                fields.extend(whois.channels.iter().cloned());
                fields
            }
            Self::Command {
                server,
                origin,
                channel,
                plugin,
                body,
            } => vec![
                server.clone(),
                origin.clone(),
                channel.clone(),
                plugin.clone(),
                body.clone(),
            ],
        }
    }

    /// One-line record for control-socket watchers.
    ///
    /// Fields containing whitespace (or nothing at all) are quoted,
    /// with embedded quotes and backslashes escaped. The grammar
    /// matches the inbound verb grammar, so a watcher can replay a log
    /// as commands.
    pub fn to_line(&self) -> String {
        let mut line = self.kind().name().to_owned();
        for field in self.fields() {
            line.push(' ');
            line.push_str(&quote_field(&field));
        }
        line
    }
}

fn quote_field(field: &str) -> String {
    if !field.is_empty() && !field.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        return field.to_owned();
    }

    let mut quoted = String::with_capacity(field.len() + 2);
    quoted.push('"');
    for c in field.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}
