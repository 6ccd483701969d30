//! Packet framing for the four protocol levels.
//!
//! Wire strings are parsed once, here, into a [`Packet`]; the cipher code
//! never slices raw strings itself.
//!
//! Wire formats:
//!   OTP        base64(text XOR keystream)
//!   AES        base64(IV[16] || ciphertext)
//!   PQC-Hybrid PQC_v1.<base64(HMAC-SHA256(aes packet))>.<aes packet>
//!   Plaintext  PLAIN_<base64(text)>

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cipher::CipherError;

pub const PQC_PREFIX: &str = "PQC_v1.";
pub const PLAIN_PREFIX: &str = "PLAIN_";
const PQC_DELIMITER: char = '.';

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolLevel {
    Otp,
    Aes,
    PqcHybrid,
    Plaintext,
}

impl ProtocolLevel {
    pub const ALL: [ProtocolLevel; 4] = [
        ProtocolLevel::Otp,
        ProtocolLevel::Aes,
        ProtocolLevel::PqcHybrid,
        ProtocolLevel::Plaintext,
    ];

    /// Whether encoding at this level consumes key material.
    pub fn uses_key(self) -> bool {
        !matches!(self, ProtocolLevel::Plaintext)
    }

    /// 1-based security level as shown to users.
    pub fn number(self) -> u8 {
        match self {
            ProtocolLevel::Otp => 1,
            ProtocolLevel::Aes => 2,
            ProtocolLevel::PqcHybrid => 3,
            ProtocolLevel::Plaintext => 4,
        }
    }
}

impl fmt::Display for ProtocolLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolLevel::Otp => "otp",
            ProtocolLevel::Aes => "aes",
            ProtocolLevel::PqcHybrid => "pqc",
            ProtocolLevel::Plaintext => "plain",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol level: {0}")]
pub struct UnknownLevel(pub String);

impl FromStr for ProtocolLevel {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "otp" => Ok(ProtocolLevel::Otp),
            "2" | "aes" => Ok(ProtocolLevel::Aes),
            "3" | "pqc" | "pqc-hybrid" | "pqc_hybrid" => Ok(ProtocolLevel::PqcHybrid),
            "4" | "plain" | "plaintext" => Ok(ProtocolLevel::Plaintext),
            other => Err(UnknownLevel(other.to_string())),
        }
    }
}

/// A wire string split into its protocol-specific fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    Otp(&'a str),
    Aes(&'a str),
    Pqc { signature: &'a str, payload: &'a str },
    Plain(&'a str),
}

impl<'a> Packet<'a> {
    /// Parse `wire` as a packet of the given level.
    pub fn parse(level: ProtocolLevel, wire: &'a str) -> Result<Self, CipherError> {
        match level {
            ProtocolLevel::Otp => Ok(Packet::Otp(wire)),
            ProtocolLevel::Aes => Ok(Packet::Aes(wire)),
            ProtocolLevel::PqcHybrid => {
                let rest = wire
                    .strip_prefix(PQC_PREFIX)
                    .ok_or(CipherError::InvalidProtocolFormat("missing PQC_v1 prefix"))?;
                let mut fields = rest.split(PQC_DELIMITER);
                match (fields.next(), fields.next(), fields.next()) {
                    (Some(signature), Some(payload), None)
                        if !signature.is_empty() && !payload.is_empty() =>
                    {
                        Ok(Packet::Pqc { signature, payload })
                    }
                    _ => Err(CipherError::InvalidProtocolFormat(
                        "expected PQC_v1.<signature>.<payload>",
                    )),
                }
            }
            ProtocolLevel::Plaintext => wire
                .strip_prefix(PLAIN_PREFIX)
                .map(Packet::Plain)
                .ok_or(CipherError::InvalidProtocolFormat("missing PLAIN_ prefix")),
        }
    }
}

impl fmt::Display for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Otp(body) | Packet::Aes(body) => f.write_str(body),
            Packet::Pqc { signature, payload } => {
                write!(f, "{PQC_PREFIX}{signature}{PQC_DELIMITER}{payload}")
            }
            Packet::Plain(body) => write!(f, "{PLAIN_PREFIX}{body}"),
        }
    }
}

/// Output of one encode: what the transport sends and the transcript records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurePacket {
    pub level: ProtocolLevel,
    pub ciphertext: String,
    pub key_id: String,
}
