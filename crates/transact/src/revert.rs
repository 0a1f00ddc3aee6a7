// Copyright 2023-, GraphOps and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Decodes the `Error(string)` ABI encoding out of a revert's return data.
//!
//! Layout (hex string, `0x`-prefixed): 4-byte selector, a 32-byte offset
//! word, a 32-byte length word, then the UTF-8 payload itself. The payload
//! always starts at character offset 138 (`2 + 8 + 64 + 64`).

const PAYLOAD_OFFSET: usize = 138;
const LENGTH_WORD_START: usize = 74;

/// Returns `None` if `return_data` is too short to carry a revert string, or
/// isn't valid UTF-8 once decoded.
pub fn decode_revert_reason(return_data: &str) -> Option<String> {
    let hex = return_data.strip_prefix("0x").unwrap_or(return_data);
    let hex = format!("0x{hex}");

    if hex.len() < PAYLOAD_OFFSET {
        return None;
    }

    let length_word = &hex[LENGTH_WORD_START..PAYLOAD_OFFSET];
    let byte_len = usize::from_str_radix(length_word, 16).ok()?;
    let payload_hex_len = byte_len * 2;

    let payload = hex.get(PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload_hex_len)?;
    let bytes = hex_decode(payload)?;
    String::from_utf8(bytes).ok()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_error_string(message: &str) -> String {
        let mut hex = String::from("0x08c379a0");
        hex.push_str(&"0".repeat(63));
        hex.push('0'); // not a real offset, irrelevant to the decoder
        hex.push_str(&format!("{:064x}", message.len()));
        let mut payload = hex::encode(message.as_bytes());
        while payload.len() % 64 != 0 {
            payload.push('0');
        }
        hex.push_str(&payload);
        hex
    }

    #[test]
    fn decodes_a_well_formed_error_string() {
        let encoded = encode_error_string("out of gas");
        assert_eq!(decode_revert_reason(&encoded).as_deref(), Some("out of gas"));
    }

    #[test]
    fn returns_none_for_short_payloads() {
        assert_eq!(decode_revert_reason("0x08c379a0"), None);
    }
}
