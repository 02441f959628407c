use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::InstanceId;

/// Position of a message in the single total order of the log.
///
/// Assigned by the log store at commit time. `Sequence::ZERO` means
/// "nothing received yet" and is never assigned to a message.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub i64);

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// A committed chat message. Immutable once persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sequence: Sequence,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_label: Option<String>,
    pub committed_at: DateTime<Utc>,
}

/// A candidate message as received from a client, before commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub content: String,
    #[serde(default)]
    pub dedup_token: Option<String>,
    #[serde(default)]
    pub sender_label: Option<String>,
}

impl Submission {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            dedup_token: None,
            sender_label: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.dedup_token = Some(token.into());
        self
    }

    pub fn with_sender(mut self, label: impl Into<String>) -> Self {
        self.sender_label = Some(label.into());
        self
    }

    /// The dedup token, with an empty string treated as absent.
    pub fn token(&self) -> Option<&str> {
        self.dedup_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// How far dedup token uniqueness reaches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DedupScope {
    /// A token is unique across the whole log.
    #[default]
    Global,
    /// A token is unique per sender label.
    PerSender,
}

impl DedupScope {
    /// Storage key enforcing uniqueness for a submission, or `None` when no
    /// dedup was requested.
    ///
    /// Per-sender keys are `<label byte length>:<label><token>`.
    pub fn key(self, submission: &Submission) -> Option<String> {
        let token = submission.token()?;
        Some(match self {
            Self::Global => token.to_owned(),
            Self::PerSender => {
                let label = submission.sender_label.as_deref().unwrap_or_default();
                format!("{}:{label}{token}", label.len())
            }
        })
    }
}

impl fmt::Display for DedupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::PerSender => f.write_str("perSender"),
        }
    }
}

impl FromStr for DedupScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "persender" | "per_sender" | "per-sender" => Ok(Self::PerSender),
            other => Err(format!("unknown dedup scope: {other}")),
        }
    }
}

/// A committed message on its way to every connected client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    /// Instance that committed the message.
    pub origin: InstanceId,
    pub message: Message,
}

impl BroadcastEvent {
    pub fn new(origin: InstanceId, message: Message) -> Self {
        Self { origin, message }
    }

    pub fn sequence(&self) -> Sequence {
        self.message.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_absent() {
        let s = Submission::new("hi").with_token("");
        assert_eq!(s.token(), None);
        assert_eq!(DedupScope::Global.key(&s), None);
        assert_eq!(DedupScope::PerSender.key(&s), None);
    }

    #[test]
    fn global_key_is_token() {
        let s = Submission::new("hi").with_token("tok-1").with_sender("ann");
        assert_eq!(DedupScope::Global.key(&s).as_deref(), Some("tok-1"));
    }

    #[test]
    fn per_sender_keys_differ_by_sender() {
        let a = Submission::new("hi").with_token("tok-1").with_sender("ann");
        let b = Submission::new("hi").with_token("tok-1").with_sender("bob");
        assert_ne!(DedupScope::PerSender.key(&a), DedupScope::PerSender.key(&b));
    }

    #[test]
    fn per_sender_without_label_still_keyed() {
        let s = Submission::new("hi").with_token("tok-1");
        assert_eq!(DedupScope::PerSender.key(&s).as_deref(), Some("0:tok-1"));
    }

    #[test]
    fn per_sender_key_is_unambiguous() {
        let a = Submission::new("hi").with_token("b").with_sender("a:");
        let b = Submission::new("hi").with_token(":b").with_sender("a");
        let c = Submission::new("hi").with_token("b").with_sender("a\u{1f}");
        let d = Submission::new("hi").with_token("\u{1f}b").with_sender("a");
        assert_ne!(DedupScope::PerSender.key(&a), DedupScope::PerSender.key(&b));
        assert_ne!(DedupScope::PerSender.key(&c), DedupScope::PerSender.key(&d));
    }

    #[test]
    fn dedup_scope_parses() {
        assert_eq!("global".parse::<DedupScope>().unwrap(), DedupScope::Global);
        assert_eq!("perSender".parse::<DedupScope>().unwrap(), DedupScope::PerSender);
        assert_eq!("per-sender".parse::<DedupScope>().unwrap(), DedupScope::PerSender);
        assert!("room".parse::<DedupScope>().is_err());
    }

    #[test]
    fn dedup_scope_serde_is_camel_case() {
        let json = serde_json::to_string(&DedupScope::PerSender).unwrap();
        assert_eq!(json, "\"perSender\"");
    }

    #[test]
    fn sequence_orders_numerically() {
        assert!(Sequence(2) > Sequence(1));
        assert_eq!(Sequence::default(), Sequence::ZERO);
        assert_eq!(Sequence(7).to_string(), "7");
    }

    #[test]
    fn submission_deserializes_with_missing_optionals() {
        let s: Submission = serde_json::from_str(r#"{"content":"hello"}"#).unwrap();
        assert_eq!(s.content, "hello");
        assert!(s.dedup_token.is_none());
        assert!(s.sender_label.is_none());
    }
}
