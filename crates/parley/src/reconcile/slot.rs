//! State slot names.

use std::fmt;
use std::str::FromStr;

/// A named piece of client state that can be re-read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The caller, with the accounts they belong to.
    Me,
    Account(String),
    /// Conversations of an account.
    Conversations(String),
    Conversation(String),
    /// Messages of a conversation.
    Messages(String),
    /// Every user. Elevated only.
    Users,
    User(String),
    /// Every setting. Elevated only.
    Settings,
}

impl FromStr for Slot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slot = match s.split_once(':') {
            None => match s {
                "me" => Slot::Me,
                "users" => Slot::Users,
                "settings" => Slot::Settings,
                _ => return Err(format!("unknown slot: {s}")),
            },
            Some((_, "")) => return Err(format!("slot is missing its id: {s}")),
            Some((kind, id)) => {
                let id = id.to_string();
                match kind {
                    "account" => Slot::Account(id),
                    "conversations" => Slot::Conversations(id),
                    "conversation" => Slot::Conversation(id),
                    "messages" => Slot::Messages(id),
                    "user" => Slot::User(id),
                    _ => return Err(format!("unknown slot: {s}")),
                }
            }
        };
        Ok(slot)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Me => f.write_str("me"),
            Slot::Account(id) => write!(f, "account:{id}"),
            Slot::Conversations(id) => write!(f, "conversations:{id}"),
            Slot::Conversation(id) => write!(f, "conversation:{id}"),
            Slot::Messages(id) => write!(f, "messages:{id}"),
            Slot::Users => f.write_str("users"),
            Slot::User(id) => write!(f, "user:{id}"),
            Slot::Settings => f.write_str("settings"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slots() {
        assert_eq!("me".parse::<Slot>(), Ok(Slot::Me));
        assert_eq!(
            "messages:conv_1".parse::<Slot>(),
            Ok(Slot::Messages("conv_1".to_string()))
        );
        assert_eq!("users".parse::<Slot>(), Ok(Slot::Users));
        assert!("conversation:".parse::<Slot>().is_err());
        assert!("widgets".parse::<Slot>().is_err());
        assert!("widget:1".parse::<Slot>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for name in ["me", "account:acct_1", "conversations:acct_1", "user:usr_1", "settings"] {
            assert_eq!(name.parse::<Slot>().unwrap().to_string(), name);
        }
    }
}
