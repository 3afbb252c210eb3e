//! Pluggable message codec boundary and response classification.
//!
//! The engine never interprets ISO 8583 payloads itself. A [`MessageCodec`]
//! packs outbound messages, unpacks inbound payloads, and exposes the MTI
//! and string fields the engine needs for correlation. Tests supply a
//! trivial in-memory codec; production embedders plug in a real field
//! packer.

use crate::errors::BoxError;

/// Codec for a concrete ISO 8583 message representation.
pub trait MessageCodec: Send + Sync + 'static {
    /// Message type produced and consumed by this codec.
    type Message: Send + 'static;

    /// Serialise a message into wire bytes.
    ///
    /// # Errors
    /// Returns the codec's own error when the message cannot be packed.
    fn pack(&self, message: &Self::Message) -> Result<Vec<u8>, BoxError>;

    /// Parse wire bytes into a message.
    ///
    /// # Errors
    /// Returns the codec's own error when the payload is malformed.
    fn unpack(&self, raw: &[u8]) -> Result<Self::Message, BoxError>;

    /// Message Type Indicator, when present.
    fn mti(&self, message: &Self::Message) -> Option<String>;

    /// String value of a numbered field, when present.
    fn string_field(&self, message: &Self::Message, field: u32) -> Option<String>;
}

/// Position of the message-function character within the MTI.
const MESSAGE_FUNCTION_INDEX: usize = 2;

/// Message-function characters that mark a reply to earlier traffic:
/// request response, advice response, notification acknowledgement and
/// instruction acknowledgement.
const RESPONSE_FUNCTIONS: [char; 4] = ['1', '3', '5', '7'];

/// Whether an MTI denotes a response to an earlier request.
///
/// MTIs shorter than four characters are never responses.
#[must_use]
pub fn is_response(mti: &str) -> bool {
    if mti.chars().count() < 4 {
        return false;
    }
    mti.chars()
        .nth(MESSAGE_FUNCTION_INDEX)
        .is_some_and(|function| RESPONSE_FUNCTIONS.contains(&function))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::network_request("0800", false)]
    #[case::network_response("0810", true)]
    #[case::financial_request("0200", false)]
    #[case::financial_response("0210", true)]
    #[case::advice_response("0230", true)]
    #[case::notification_ack("0250", true)]
    #[case::instruction_ack("0270", true)]
    #[case::reversal_advice("0420", false)]
    #[case::too_short("081", false)]
    #[case::empty("", false)]
    fn classifies_by_message_function(#[case] mti: &str, #[case] expected: bool) {
        assert_eq!(is_response(mti), expected);
    }
}
