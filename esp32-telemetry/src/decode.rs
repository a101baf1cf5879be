use crate::channel::Channel;
use std::str;
use thiserror::Error;

/// Payloads of at least this many bytes are decoded as a little-endian IEEE-754 float.
const FLOAT_LENGTH: usize = 4;

/// An error decoding a characteristic value.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DecodeError {
    #[error("{channel} value {value:?} is not valid UTF-8")]
    InvalidUtf8 { channel: Channel, value: Vec<u8> },
    #[error("{channel} value {text:?} is not a decimal number")]
    InvalidNumber { channel: Channel, text: String },
}

impl DecodeError {
    /// The channel whose value failed to decode.
    pub fn channel(&self) -> Channel {
        match self {
            Self::InvalidUtf8 { channel, .. } | Self::InvalidNumber { channel, .. } => *channel,
        }
    }
}

/// Decode the raw bytes of a telemetry characteristic.
///
/// If the value is at least 4 bytes long then the first 4 bytes are taken as a little-endian
/// `f32`, whatever they contain. This means that a 4 character decimal string such as `"85.5"` is
/// decoded as a float rather than as text. Shorter values are parsed as a decimal string.
pub fn decode(channel: Channel, value: &[u8]) -> Result<f32, DecodeError> {
    if let [a, b, c, d, ..] = *value {
        return Ok(f32::from_le_bytes([a, b, c, d]));
    }

    let text = str::from_utf8(value).map_err(|_| DecodeError::InvalidUtf8 {
        channel,
        value: value.to_owned(),
    })?;
    text.trim()
        .parse()
        .map_err(|_| DecodeError::InvalidNumber {
            channel,
            text: text.to_owned(),
        })
}

/// Encode a value the way the sensor does, as a 4-byte little-endian `f32`.
pub fn encode(value: f32) -> [u8; FLOAT_LENGTH] {
    value.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_float() {
        assert_eq!(decode(Channel::Rpm, &[0x00, 0x00, 0x48, 0x43]), Ok(200.0));
    }

    #[test]
    fn decode_float_ignores_trailing_bytes() {
        assert_eq!(
            decode(Channel::Fuel, &[0x00, 0x00, 0x48, 0x43, 0xff, 0xff]),
            Ok(200.0)
        );
    }

    #[test]
    fn decode_encoded() {
        for value in [0.0, -40.5, 85.25, 6500.0, f32::MAX, f32::MIN_POSITIVE] {
            assert_eq!(decode(Channel::Temperature, &encode(value)), Ok(value));
        }
    }

    #[test]
    fn decode_four_character_string_as_float() {
        let decoded = decode(Channel::Temperature, b"85.5").unwrap();
        assert_eq!(decoded, f32::from_le_bytes(*b"85.5"));
        assert_ne!(decoded, 85.5);
    }

    #[test]
    fn decode_short_string() {
        assert_eq!(decode(Channel::Temperature, b"8.5"), Ok(8.5));
        assert_eq!(decode(Channel::Fuel, b"42"), Ok(42.0));
        assert_eq!(decode(Channel::Rpm, b"7"), Ok(7.0));
    }

    #[test]
    fn decode_short_string_with_whitespace() {
        assert_eq!(decode(Channel::Fuel, b" 9 "), Ok(9.0));
    }

    #[test]
    fn decode_empty() {
        assert_eq!(
            decode(Channel::Rpm, &[]),
            Err(DecodeError::InvalidNumber {
                channel: Channel::Rpm,
                text: String::new()
            })
        );
    }

    #[test]
    fn decode_not_a_number() {
        let error = decode(Channel::Fuel, b"ab").unwrap_err();
        assert_eq!(
            error,
            DecodeError::InvalidNumber {
                channel: Channel::Fuel,
                text: "ab".to_string()
            }
        );
        assert_eq!(error.channel(), Channel::Fuel);
    }

    #[test]
    fn decode_invalid_utf8() {
        assert_eq!(
            decode(Channel::Temperature, &[0xff, 0xfe]),
            Err(DecodeError::InvalidUtf8 {
                channel: Channel::Temperature,
                value: vec![0xff, 0xfe]
            })
        );
    }

    #[test]
    fn error_display() {
        let error = DecodeError::InvalidNumber {
            channel: Channel::Rpm,
            text: "x".to_string(),
        };
        assert_eq!(error.to_string(), "RPM value \"x\" is not a decimal number");
    }
}
