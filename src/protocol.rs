use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Result codes shared verbatim between the core and external task
/// implementations. The numeric values are wire format for the RPC
/// bridge and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RetVal {
    Ok = 0,
    UserNotFound = 1,
    ChannelNotFound = 2,
    AttributeNotFound = 3,
    FailedUserDM = 4,
    FailedChannelJoin = 5,
    DatumNotFound = 6,
    DatumLockExpired = 7,
    DataFormatError = 8,
    BrainFailed = 9,
    InvalidDatumKey = 10,
    InvalidDblPtr = 11,
    InvalidCfgStruct = 12,
    NoConfigFound = 13,
    TechnicalProblem = 14,
    GeneralError = 15,
    ReplyNotMatched = 16,
    UseDefaultValue = 17,
    TimeoutExpired = 18,
    Interrupted = 19,
    MatcherNotFound = 20,
    NoUserEmail = 21,
    NoBotEmail = 22,
    MailError = 23,
}

impl RetVal {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        use RetVal::*;
        let all = [
            Ok,
            UserNotFound,
            ChannelNotFound,
            AttributeNotFound,
            FailedUserDM,
            FailedChannelJoin,
            DatumNotFound,
            DatumLockExpired,
            DataFormatError,
            BrainFailed,
            InvalidDatumKey,
            InvalidDblPtr,
            InvalidCfgStruct,
            NoConfigFound,
            TechnicalProblem,
            GeneralError,
            ReplyNotMatched,
            UseDefaultValue,
            TimeoutExpired,
            Interrupted,
            MatcherNotFound,
            NoUserEmail,
            NoBotEmail,
            MailError,
        ];
        all.get(code as usize).copied()
    }
}

impl Serialize for RetVal {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for RetVal {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u64::deserialize(deserializer)?;
        RetVal::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown result code {code}")))
    }
}

/// Outcome of one task step, reported by native handlers directly and
/// by external tasks through their exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Normal,
    Fail,
    MechanismFail,
    ConfigurationError,
}

impl TaskOutcome {
    /// Exit-code protocol for external tasks. Signals and unknown
    /// codes count as mechanism failures.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => TaskOutcome::Normal,
            Some(1) => TaskOutcome::Fail,
            Some(2) => TaskOutcome::MechanismFail,
            Some(3) => TaskOutcome::ConfigurationError,
            _ => TaskOutcome::MechanismFail,
        }
    }

    pub fn succeeded(self) -> bool {
        self == TaskOutcome::Normal
    }
}

pub const BASE64_PREFIX: &str = "base64:";

/// Decode a bridge string payload. Payloads carrying binary-unsafe
/// text arrive with a literal `base64:` prefix; everything else passes
/// through untouched.
pub fn decode_payload(s: &str) -> Option<String> {
    match s.strip_prefix(BASE64_PREFIX) {
        Some(b64) => B64
            .decode(b64)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok()),
        None => Some(s.to_string()),
    }
}

/// Encode a string for the bridge, prefixing with `base64:` when the
/// text is not plain printable ASCII.
pub fn encode_payload(s: &str) -> String {
    let safe = s
        .chars()
        .all(|c| c.is_ascii_graphic() || c == ' ' || c == '\t');
    if safe {
        s.to_string()
    } else {
        format!("{}{}", BASE64_PREFIX, B64.encode(s.as_bytes()))
    }
}
