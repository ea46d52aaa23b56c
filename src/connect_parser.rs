//! Minimal, non-destructive MQTT 3.1.1 CONNECT parser.
//!
//! Extracts the Client Identifier from a peeked byte buffer without
//! consuming the underlying stream. This is deliberately not a compliant
//! walk of the CONNECT variable header: it assumes the canonical
//! "MQTT"/level-4 header shape and reads the Client-ID length at a fixed
//! offset. Packets that deviate from that shape are reported as
//! unrecognized rather than misparsed.

/// Fixed header byte for an MQTT CONNECT packet.
const CONNECT_PACKET_TYPE: u8 = 0x10;

/// Offset of the two-byte, big-endian Client-ID length field in the
/// canonical CONNECT layout: 1 (packet type) + 1 (remaining length, single
/// byte form) + 2 (protocol name length) + 4 ("MQTT") + 1 (protocol level)
/// + 1 (connect flags) + 2 (keep-alive) = 12, then the length field itself
/// occupies bytes [12, 14).
const CLIENT_ID_LENGTH_OFFSET: usize = 12;

/// Parses the Client Identifier out of a peeked CONNECT packet.
///
/// Returns `None` when the first byte isn't a CONNECT packet type, or when
/// the declared Client-ID length runs past the end of `buf`. Returns
/// `Some("")` for a packet with a zero-length Client-ID.
#[must_use]
pub fn parse_client_id(buf: &[u8]) -> Option<String> {
    if buf.is_empty() || buf[0] != CONNECT_PACKET_TYPE {
        return None;
    }
    if buf.len() < CLIENT_ID_LENGTH_OFFSET + 2 {
        return None;
    }

    let len_bytes = [buf[CLIENT_ID_LENGTH_OFFSET], buf[CLIENT_ID_LENGTH_OFFSET + 1]];
    let client_id_len = u16::from_be_bytes(len_bytes) as usize;

    let start = CLIENT_ID_LENGTH_OFFSET + 2;
    let end = start.checked_add(client_id_len)?;
    if end > buf.len() {
        return None;
    }

    Some(String::from_utf8_lossy(&buf[start..end]).into_owned())
}
