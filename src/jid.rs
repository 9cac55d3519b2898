//! WhatsApp-style address handling.
//!
//! Two address forms exist for the same human contact: the stable
//! phone-number identity (`<digits>@s.whatsapp.net`) and a rotating
//! device-linked identity (`<opaque>@lid`). Groups (`@g.us`) are their own
//! canonical form. This module only deals with the syntactic side;
//! bridging between the two forms lives in [`crate::identity`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const PN_SERVER: &str = "s.whatsapp.net";
pub const LID_SERVER: &str = "lid";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";

/// Minimum digit count for a bare string to be considered a phone number.
const MIN_PHONE_DIGITS: usize = 8;

#[derive(Debug, Error)]
pub enum JidError {
    #[error("address has no server part: {0}")]
    MissingServer(String),
    #[error("address has an empty user part: {0}")]
    EmptyUser(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    pub user: String,
    pub server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    pub fn pn(user: impl Into<String>) -> Self {
        Self::new(user, PN_SERVER)
    }

    pub fn lid(user: impl Into<String>) -> Self {
        Self::new(user, LID_SERVER)
    }

    pub fn group(user: impl Into<String>) -> Self {
        Self::new(user, GROUP_SERVER)
    }

    /// Strip the device/agent suffix from the user part
    /// (`5511999999999:12@s.whatsapp.net` -> `5511999999999@s.whatsapp.net`).
    pub fn normalized(&self) -> Jid {
        match self.user.split_once(':') {
            Some((base, _)) => Jid::new(base, self.server.clone()),
            None => self.clone(),
        }
    }

    pub fn is_pn(&self) -> bool {
        self.server == PN_SERVER
    }

    pub fn is_lid(&self) -> bool {
        self.server == LID_SERVER
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER && self.user == "status"
    }

    pub fn is_broadcast(&self) -> bool {
        self.server == BROADCAST_SERVER
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, server) = s
            .split_once('@')
            .ok_or_else(|| JidError::MissingServer(s.to_string()))?;
        if user.is_empty() {
            return Err(JidError::EmptyUser(s.to_string()));
        }
        Ok(Jid::new(user, server))
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

/// Normalize any raw address to a canonical [`Jid`].
///
/// Full addresses are parsed and device-suffix-stripped; bare strings are
/// reduced to digits and treated as a phone identity. Returns `None` when
/// nothing address-like can be recovered.
pub fn normalize_address(raw: &str) -> Option<Jid> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('@') {
        return trimmed.parse::<Jid>().ok().map(|jid| jid.normalized());
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(Jid::pn(digits))
    }
}

/// Extract a bare digit string usable for matching legacy phone-only
/// records. Only phone-identity addresses and raw digit strings qualify;
/// device identities and groups never yield a phone candidate.
pub fn phone_candidate(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('@') {
        let jid = trimmed.parse::<Jid>().ok()?.normalized();
        if !jid.is_pn() {
            return None;
        }
        return if jid.user.is_empty() {
            None
        } else {
            Some(jid.user)
        };
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_PHONE_DIGITS {
        None
    } else {
        Some(digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let jid: Jid = "5511999999999@s.whatsapp.net".parse().unwrap();
        assert!(jid.is_pn());
        assert_eq!(jid.to_string(), "5511999999999@s.whatsapp.net");
        assert!("no-server".parse::<Jid>().is_err());
        assert!("@s.whatsapp.net".parse::<Jid>().is_err());
    }

    #[test]
    fn test_normalized_strips_device_suffix() {
        let jid: Jid = "5511999999999:58@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.normalized().user, "5511999999999");
        assert_eq!(jid.normalized().normalized(), jid.normalized());
    }

    #[test]
    fn test_normalize_address_from_digits() {
        assert_eq!(
            normalize_address("+55 (11) 99999-9999"),
            Some(Jid::pn("5511999999999"))
        );
        assert_eq!(normalize_address("   "), None);
        assert_eq!(normalize_address("no digits here"), None);
    }

    #[test]
    fn test_server_classification() {
        assert!(Jid::group("123-456").is_group());
        assert!(Jid::lid("100000012345678").is_lid());
        let status: Jid = "status@broadcast".parse().unwrap();
        assert!(status.is_status_broadcast());
        assert!(!Jid::pn("5511999999999").is_status_broadcast());
    }

    #[test]
    fn test_phone_candidate() {
        assert_eq!(
            phone_candidate("5511999999999@s.whatsapp.net"),
            Some("5511999999999".to_string())
        );
        assert_eq!(phone_candidate("100000012345678@lid"), None);
        assert_eq!(phone_candidate("123-456@g.us"), None);
        assert_eq!(
            phone_candidate("+55 11 99999-9999"),
            Some("5511999999999".to_string())
        );
        // Too few digits to be a phone number.
        assert_eq!(phone_candidate("12345"), None);
    }

    #[test]
    fn test_jid_serde_as_string() {
        let jid = Jid::pn("5511999999999");
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"5511999999999@s.whatsapp.net\"");
        let back: Jid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, jid);
    }
}
