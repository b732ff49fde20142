use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const STATUS_BROADCAST_USER: &str = "status";

pub type MessageId = String;

#[derive(Debug)]
pub enum JidError {
    InvalidFormat(String),
    Parse(std::num::ParseIntError),
}

impl fmt::Display for JidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JidError::InvalidFormat(s) => write!(f, "Invalid JID format: {s}"),
            JidError::Parse(e) => write!(f, "Failed to parse component: {e}"),
        }
    }
}

impl std::error::Error for JidError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JidError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::num::ParseIntError> for JidError {
    fn from(err: std::num::ParseIntError) -> Self {
        JidError::Parse(err)
    }
}

/// An address on the messaging network: user, group, broadcast list or
/// newsletter. The optional `device` suffix (`user:device@server`)
/// identifies one companion device of a multi-device account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub device: u16,
}

impl Jid {
    pub fn new(user: &str, server: &str) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_string(),
            device: 0,
        }
    }

    pub fn group(id: &str) -> Self {
        Self::new(id, GROUP_SERVER)
    }

    pub fn status_broadcast() -> Self {
        Self::new(STATUS_BROADCAST_USER, BROADCAST_SERVER)
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER && self.user == STATUS_BROADCAST_USER
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == NEWSLETTER_SERVER
    }

    pub fn is_empty(&self) -> bool {
        self.server.is_empty()
    }

    /// Strips the device suffix, yielding the account-level address.
    pub fn to_non_device(&self) -> Self {
        Self {
            user: self.user.clone(),
            server: self.server.clone(),
            device: 0,
        }
    }

    pub fn is_same_user_as(&self, other: &Jid) -> bool {
        self.user == other.user && self.server == other.server
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(JidError::InvalidFormat(s.to_string()));
        }

        let (user_part, server) = match s.split_once('@') {
            Some((u, srv)) => (u, srv.to_string()),
            None => ("", s.to_string()),
        };

        if user_part.is_empty() {
            return Ok(Jid::new("", &server));
        }

        let (user, device) = match user_part.rsplit_once(':') {
            Some((u, d_str)) => (u, d_str.parse()?),
            None => (user_part, 0),
        };

        Ok(Jid {
            user: user.to_string(),
            server,
            device,
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_jid() {
        let jid: Jid = "554499999999@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user, "554499999999");
        assert_eq!(jid.server, DEFAULT_USER_SERVER);
        assert_eq!(jid.device, 0);
        assert!(!jid.is_group());
    }

    #[test]
    fn parses_device_suffix_and_strips_it() {
        let jid: Jid = "554499999999:12@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.device, 12);
        assert_eq!(
            jid.to_non_device().to_string(),
            "554499999999@s.whatsapp.net"
        );
    }

    #[test]
    fn group_and_status_broadcast_predicates() {
        let group: Jid = "120363021033254949@g.us".parse().unwrap();
        assert!(group.is_group());

        let status: Jid = "status@broadcast".parse().unwrap();
        assert!(status.is_status_broadcast());
        assert!(status.is_broadcast());
        assert!(!status.is_group());
    }

    #[test]
    fn display_round_trip() {
        for raw in [
            "554499999999@s.whatsapp.net",
            "120363021033254949@g.us",
            "status@broadcast",
            "554499999999:3@s.whatsapp.net",
        ] {
            let jid: Jid = raw.parse().unwrap();
            assert_eq!(jid.to_string(), raw);
        }
    }
}
