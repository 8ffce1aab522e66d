use std::{fmt, str::FromStr};

use thiserror::Error;

const BROADCAST_TOKEN: &str = "*";
const IDENTITY_TOKEN: &str = "self";
const JOIN_TOKEN: &str = "join";
const QUIT_TOKEN: &str = "quit";

/// Identifier a relay hands out to each admitted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(u64);

impl MemberId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MemberId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Addressee of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Broadcast,
    Member(MemberId),
    /// A token that cannot name any member, e.g. `01` or `abc`.
    Unknown(String),
}

impl Target {
    fn from_token(token: &str) -> Self {
        if token == BROADCAST_TOKEN {
            return Target::Broadcast;
        }

        // Only the canonical decimal form names a member: "01" and "+1" do not.
        match token.parse::<MemberId>() {
            Ok(id) if id.to_string() == token => Target::Member(id),
            _ => Target::Unknown(token.to_string()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Broadcast => f.write_str(BROADCAST_TOKEN),
            Target::Member(id) => write!(f, "{id}"),
            Target::Unknown(token) => f.write_str(token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("message has no whitespace-separated payload")]
pub struct MalformedMessage;

/// A message as sent by a member: `<target> <payload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub target: Target,
    pub payload: String,
}

impl Inbound {
    /// Splits on the first whitespace run. The payload keeps any inner or
    /// trailing whitespace.
    pub fn parse(text: &str) -> Result<Self, MalformedMessage> {
        let text = text.trim_start();
        let split_at = text.find(char::is_whitespace).ok_or(MalformedMessage)?;
        let (target, rest) = text.split_at(split_at);
        let payload = rest.trim_start();
        if payload.is_empty() {
            return Err(MalformedMessage);
        }

        Ok(Self {
            target: Target::from_token(target),
            payload: payload.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Tells a newcomer which id is its own.
    Identity,
    Join,
    Quit,
    Text(String),
}

impl Payload {
    fn from_text(text: &str) -> Self {
        match text {
            IDENTITY_TOKEN => Payload::Identity,
            JOIN_TOKEN => Payload::Join,
            QUIT_TOKEN => Payload::Quit,
            other => Payload::Text(other.to_string()),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Identity => f.write_str(IDENTITY_TOKEN),
            Payload::Join => f.write_str(JOIN_TOKEN),
            Payload::Quit => f.write_str(QUIT_TOKEN),
            Payload::Text(text) => f.write_str(text),
        }
    }
}

/// A message as delivered to a member: `<source> <payload>`.
///
/// Relayed text that happens to read `self`, `join` or `quit` is
/// indistinguishable from the corresponding event once on the wire, so
/// parsing favours the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source: MemberId,
    pub payload: Payload,
}

impl Envelope {
    pub fn identity(source: MemberId) -> Self {
        Self {
            source,
            payload: Payload::Identity,
        }
    }

    pub fn join(source: MemberId) -> Self {
        Self {
            source,
            payload: Payload::Join,
        }
    }

    pub fn quit(source: MemberId) -> Self {
        Self {
            source,
            payload: Payload::Quit,
        }
    }

    pub fn text(source: MemberId, text: impl Into<String>) -> Self {
        Self {
            source,
            payload: Payload::Text(text.into()),
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.source, self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeParseError {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
    #[error("source '{0}' is not a member id")]
    InvalidSource(String),
}

impl FromStr for Envelope {
    type Err = EnvelopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Inbound { target, payload } = Inbound::parse(s)?;
        let source = match target {
            Target::Member(id) => id,
            other => return Err(EnvelopeParseError::InvalidSource(other.to_string())),
        };

        Ok(Self {
            source,
            payload: Payload::from_text(&payload),
        })
    }
}
