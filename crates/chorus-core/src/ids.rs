use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// One live WebSocket channel.
branded_id!(ConnectionId, "conn");
// Transport continuity handle handed to the client; survives a reconnect.
branded_id!(SessionToken, "sess");
// One service process sharing the log.
branded_id!(InstanceId, "inst");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_has_prefix() {
        let id = ConnectionId::new();
        assert!(id.as_str().starts_with("conn_"), "got: {id}");
    }

    #[test]
    fn session_token_has_prefix() {
        let id = SessionToken::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn instance_id_has_prefix() {
        let id = InstanceId::new();
        assert!(id.as_str().starts_with("inst_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_str_preserves_value() {
        let parsed: SessionToken = "sess_custom".parse().unwrap();
        assert_eq!(parsed, SessionToken::from_raw("sess_custom"));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = InstanceId::from_raw("inst_a");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"inst_a\"");
    }
}
