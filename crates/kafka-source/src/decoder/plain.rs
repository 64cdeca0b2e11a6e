use std::borrow::Cow;

use serde_json::Value;

use crate::error::DecodeError;

/// Character encodings accepted for plain JSON messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Ascii,
    Latin1,
}

impl Encoding {
    /// Parse an encoding name as written in the config (`utf-8`, `ascii`,
    /// `latin-1`, `iso-8859-1`, ...).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Some(Encoding::Utf8),
            "ascii" | "us-ascii" => Some(Encoding::Ascii),
            "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => Some(Encoding::Latin1),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin-1",
        }
    }

    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>, DecodeError> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes)
                .map(Cow::Borrowed)
                .map_err(|e| DecodeError::Encoding {
                    encoding: self.name(),
                    reason: e.to_string(),
                }),
            Encoding::Ascii => match bytes.iter().position(|b| !b.is_ascii()) {
                Some(position) => Err(DecodeError::Encoding {
                    encoding: self.name(),
                    reason: format!(
                        "byte 0x{:02x} at position {position} is out of range",
                        bytes[position]
                    ),
                }),
                // ASCII is a subset of UTF-8
                None => Ok(Cow::Borrowed(
                    std::str::from_utf8(bytes).unwrap_or_default(),
                )),
            },
            Encoding::Latin1 => Ok(Cow::Owned(bytes.iter().map(|&b| b as char).collect())),
        }
    }
}

/// Decodes message values as text in a fixed encoding, then as JSON.
#[derive(Debug, Clone)]
pub struct PlainTextDecoder {
    encoding: Encoding,
}

impl PlainTextDecoder {
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Value, DecodeError> {
        let text = self.encoding.decode(payload)?;
        Ok(serde_json::from_str(&text)?)
    }
}
