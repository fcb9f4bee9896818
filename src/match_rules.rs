//! D-Bus match rule parsing and matching.
//!
//! Signal observers registered on a connection filter what they receive with
//! match rules, e.g. `type='signal',interface='org.example.Foo',member='Changed'`.
//! Only header keys are supported; `argN` filters need the message body and are
//! refused at parse time.

use thiserror::Error;
use tracing::trace;

use crate::message::{Envelope, MessageKind};

/// Error parsing a match rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchRuleError {
    /// Invalid match rule format.
    #[error("Invalid match rule format: {0}")]
    InvalidFormat(String),
    /// The key is valid D-Bus but not supported here.
    #[error("Unsupported match rule key: {0}")]
    Unsupported(String),
}

/// A parsed D-Bus match rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    /// Message type filter.
    pub msg_type: Option<MessageKind>,
    /// Sender filter.
    pub sender: Option<String>,
    /// Interface filter.
    pub interface: Option<String>,
    /// Member (method/signal name) filter.
    pub member: Option<String>,
    /// Object path filter.
    pub path: Option<String>,
    /// Object path namespace filter (matches path and all children).
    pub path_namespace: Option<String>,
    /// Destination filter.
    pub destination: Option<String>,
}

impl MatchRule {
    /// Rule matching every signal.
    pub fn signals() -> Self {
        Self {
            msg_type: Some(MessageKind::Signal),
            ..Self::default()
        }
    }

    /// Restrict to an interface.
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Restrict to a member.
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Restrict to a path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Parse a match rule string.
    ///
    /// Match rules are comma-separated key=value pairs; values may be quoted
    /// with single quotes. An empty rule matches everything.
    pub fn parse(rule: &str) -> Result<Self, MatchRuleError> {
        let mut result = MatchRule::default();
        let mut remaining = rule.trim();

        while !remaining.is_empty() {
            // Skip leading whitespace and commas
            remaining = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
            if remaining.is_empty() {
                break;
            }

            let eq_pos = remaining
                .find('=')
                .ok_or_else(|| MatchRuleError::InvalidFormat(format!("Missing '=' in: {}", remaining)))?;
            let key = remaining[..eq_pos].trim();
            remaining = remaining[eq_pos + 1..].trim_start();

            let value = if let Some(quoted) = remaining.strip_prefix('\'') {
                let end = quoted
                    .find('\'')
                    .ok_or_else(|| MatchRuleError::InvalidFormat("Unclosed quote".to_string()))?;
                remaining = &quoted[end + 1..];
                quoted[..end].to_string()
            } else {
                let end = remaining.find(',').unwrap_or(remaining.len());
                let value = remaining[..end].trim().to_string();
                remaining = &remaining[end..];
                value
            };

            match key {
                "type" => {
                    let kind = MessageKind::from_name(&value).ok_or_else(|| {
                        MatchRuleError::InvalidFormat(format!("Unknown message type: {}", value))
                    })?;
                    result.msg_type = Some(kind);
                }
                "sender" => result.sender = Some(value),
                "interface" => result.interface = Some(value),
                "member" => result.member = Some(value),
                "path" => result.path = Some(value),
                "path_namespace" => result.path_namespace = Some(value),
                "destination" => result.destination = Some(value),
                key if key.starts_with("arg") => {
                    return Err(MatchRuleError::Unsupported(key.to_string()));
                }
                "eavesdrop" => trace!("Ignoring eavesdrop in match rule"),
                _ => {
                    // Unknown keys are ignored
                    trace!(key = key, "Ignoring unknown match rule key");
                }
            }
        }

        if result.path.is_some() && result.path_namespace.is_some() {
            return Err(MatchRuleError::InvalidFormat(
                "path and path_namespace are mutually exclusive".to_string(),
            ));
        }

        Ok(result)
    }

    /// Check if a message matches this rule.
    pub fn matches<E: Envelope>(&self, msg: &E) -> bool {
        if let Some(kind) = self.msg_type {
            if msg.kind() != kind {
                return false;
            }
        }

        let field_matches = |filter: &Option<String>, actual: Option<String>| match filter {
            Some(expected) => actual.as_deref() == Some(expected.as_str()),
            None => true,
        };

        if !field_matches(&self.sender, msg.sender_str())
            || !field_matches(&self.interface, msg.interface_str())
            || !field_matches(&self.member, msg.member_str())
            || !field_matches(&self.path, msg.path_str())
            || !field_matches(&self.destination, msg.destination_str())
        {
            return false;
        }

        // path_namespace matches the path itself and all children
        if let Some(ns) = &self.path_namespace {
            let Some(path) = msg.path_str() else {
                return false;
            };
            if ns != "/" && path != *ns && !path.starts_with(&format!("{}/", ns)) {
                return false;
            }
        }

        true
    }
}

impl std::str::FromStr for MatchRule {
    type Err = MatchRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for MatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(kind) = self.msg_type {
            parts.push(format!("type='{}'", kind));
        }
        let fields = [
            ("sender", &self.sender),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("destination", &self.destination),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                parts.push(format!("{}='{}'", key, value));
            }
        }
        f.write_str(&parts.join(","))
    }
}
