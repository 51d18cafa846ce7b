//! Cluster hash-slot computation: hash-tag extraction plus CRC16-XMODEM.

use crc16::{State, XMODEM};

/// Total number of hash slots in a Redis Cluster deployment.
pub const SLOT_COUNT: u16 = 16384;

/// Computes the hash slot (0..16384) for a key, honoring `{...}` hash tags:
/// if the key contains a non-empty `{tag}` substring, only the tag is
/// hashed so that co-tagged keys land on the same slot.
pub fn key_slot(key: &[u8]) -> u16 {
    let hashed = hash_tag(key).unwrap_or(key);
    State::<XMODEM>::calculate(hashed) % SLOT_COUNT
}

/// Extracts the substring between the first `{` and the following `}` when
/// that substring is non-empty. Returns `None` when there is no `{...}`, or
/// when the braces are empty or empty-tag (`{}`) — in both cases the whole
/// key is used instead.
fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|&b| b == b'{')?;
    let close_rel = key[open + 1..].iter().position(|&b| b == b'}')?;
    if close_rel == 0 {
        return None;
    }
    Some(&key[open + 1..open + 1 + close_rel])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_tag_hashes_to_same_slot() {
        assert_eq!(key_slot(b"{tag}x"), key_slot(b"{tag}y"));
        assert_eq!(key_slot(b"{tag}x"), key_slot(b"tag"));
    }

    #[test]
    fn empty_tag_falls_back_to_whole_key() {
        assert_ne!(key_slot(b"{}key"), key_slot(b"key"));
        assert_eq!(key_slot(b"{}key"), {
            // whole literal "{}key" is hashed when the tag is empty
            crc16::State::<crc16::XMODEM>::calculate(b"{}key") % SLOT_COUNT
        });
    }

    #[test]
    fn no_braces_hashes_whole_key() {
        assert_eq!(key_slot(b"plainkey"), crc16::State::<crc16::XMODEM>::calculate(b"plainkey") % SLOT_COUNT);
    }

    #[test]
    fn slots_are_within_range() {
        for key in ["a", "b", "{x}y", "", "some-long-key-name-1234567890"] {
            assert!(key_slot(key.as_bytes()) < SLOT_COUNT);
        }
    }
}
