//! Orders: the small JSON messages a synchronisation client sends to its
//! server to mutate or query the registry.
//!
//! Exactly one of:
//!
//! ```json
//! {"link":["channel7group0",51234]}
//! {"unlink":51234}
//! {"get":"channel7group0"}
//! ```
//!
//! Only `get` is answered; link and unlink are fire-and-forget.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    /// Register the sender's `(tag, port)` pair.
    Link(String, u16),
    /// Withdraw the sender's entry for `port`.
    Unlink(u16),
    /// Ask for every address currently claiming `tag`.
    Get(String),
}

impl Order {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("order serialisation is infallible")
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_literals() {
        assert_eq!(
            Order::Link("channel7group0".to_string(), 51234).to_json(),
            r#"{"link":["channel7group0",51234]}"#
        );
        assert_eq!(Order::Unlink(51234).to_json(), r#"{"unlink":51234}"#);
        assert_eq!(
            Order::Get("channel7group0".to_string()).to_json(),
            r#"{"get":"channel7group0"}"#
        );
    }

    #[test]
    fn round_trip() {
        for order in [
            Order::Link("channel0group255".to_string(), 8767),
            Order::Unlink(8767),
            Order::Get("channel0group255".to_string()),
        ] {
            assert_eq!(Order::from_json(&order.to_json()).unwrap(), order);
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Order::from_json(r#"{"frobnicate":1}"#).is_err());
        assert!(Order::from_json("not json").is_err());
    }
}
