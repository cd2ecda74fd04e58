//! Base32 codec for DNS labels
//!
//! Packs arbitrary octets into the `A-Z2-7` alphabet so that tunnel packets can
//! travel inside query names. A sequence of 5 octets is cut into 8 blocks of
//! 5 bits:
//!
//! ```text
//!  01234567 01234567 01234567 01234567 01234567
//! +--------+--------+--------+--------+--------+
//! |< 0 >< 1| >< 2 ><|.3 >< 4.|>< 5 ><.|6 >< 7 >|
//! +--------+--------+--------+--------+--------+
//! ```
//!
//! Encoding is plain RFC 4648 base32 and delegates to `data_encoding`.
//! Decoding is hand-rolled because it must stop at the first character outside
//! the alphabet and report how much was completed, which is how padding and
//! stripped padding are both handled.

use data_encoding::BASE32;

/// Padding character emitted on encode, treated as a terminator on decode
pub const PADDING_CHAR: u8 = b'=';

/// Octets per sequence
const SEQ_OCTETS: usize = 5;

/// Characters per sequence
const SEQ_CHARS: usize = 8;

/// Encode `plain` as padded base32 (`"MY======"` for `[0x66]`)
pub fn encode(plain: &[u8]) -> String {
    BASE32.encode(plain)
}

/// Decode base32 text, stopping at the first invalid or padding character
///
/// Returns the octets completed before decoding stopped. Stripped padding is
/// fine: `decode("MY")` yields `[0x66]` just like `decode("MY======")`.
pub fn decode(coded: &str) -> Vec<u8> {
    let coded = coded.as_bytes();
    let mut plain = Vec::with_capacity(decoded_capacity(coded.len()) + SEQ_OCTETS);

    for group in coded.chunks(SEQ_CHARS) {
        let mut octets = [0u8; SEQ_OCTETS];
        let n = decode_sequence(group, &mut octets);
        plain.extend_from_slice(&octets[..n]);
        if n < SEQ_OCTETS {
            break;
        }
    }

    plain
}

/// Length of the padded encoding of `len` octets
pub const fn encoded_len(len: usize) -> usize {
    (len + SEQ_OCTETS - 1) / SEQ_OCTETS * SEQ_CHARS
}

/// Octets that always fit in `chars` encoded characters
pub const fn decoded_capacity(chars: usize) -> usize {
    chars / SEQ_CHARS * SEQ_OCTETS
}

/// Decode one 5-bit value. Lower case is accepted since resolvers may
/// randomise the case of query names.
fn decode_char(c: u8) -> Option<u8> {
    match c {
        b'A'..=b'Z' => Some(c - b'A'),
        b'a'..=b'z' => Some(c - b'a'),
        b'2'..=b'7' => Some(c - b'2' + 26),
        _ => None,
    }
}

/// Octet in which `block` starts
fn get_octet(block: usize) -> usize {
    (block * 5) / 8
}

/// Bits to drop at the end of the starting octet; negative when the block
/// continues into the next octet
fn get_offset(block: usize) -> i32 {
    8 - 5 - ((5 * block) % 8) as i32
}

/// `byte << offset`, shifting right for negative offsets
fn shift_left(byte: u8, offset: i32) -> u8 {
    if offset >= 0 {
        byte << offset
    } else {
        byte >> -offset
    }
}

/// Decode up to 8 characters into `plain`, returning the octets completed
fn decode_sequence(coded: &[u8], plain: &mut [u8; SEQ_OCTETS]) -> usize {
    for block in 0..SEQ_CHARS {
        let octet = get_octet(block);
        let offset = get_offset(block);

        let value = match coded.get(block).copied().and_then(decode_char) {
            Some(v) => v,
            None => return octet,
        };

        plain[octet] |= shift_left(value, offset);
        if offset < 0 {
            plain[octet + 1] = shift_left(value, 8 + offset);
        }
    }
    SEQ_OCTETS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4648_vectors() {
        assert_eq!(encode(b""), "");
        assert_eq!(encode(&[0x66]), "MY======");
        assert_eq!(encode(&[0x66, 0x6F]), "MZXQ====");
        assert_eq!(encode(&[0x66, 0x6F, 0x6F]), "MZXW6===");
        assert_eq!(encode(&[0x66, 0x6F, 0x6F, 0x62]), "MZXW6YQ=");
        assert_eq!(encode(&[0x66, 0x6F, 0x6F, 0x62, 0x61]), "MZXW6YTB");
        assert_eq!(encode(b"foobar"), "MZXW6YTBOI======");
    }

    #[test]
    fn test_decode_stops_at_padding() {
        assert_eq!(decode("MY======"), vec![0x66]);
        assert_eq!(decode("MZXQ===="), vec![0x66, 0x6F]);
        assert_eq!(decode("MZXW6==="), vec![0x66, 0x6F, 0x6F]);
        assert_eq!(decode("MZXW6YQ="), vec![0x66, 0x6F, 0x6F, 0x62]);
        assert_eq!(decode("MZXW6YTBOI======"), b"foobar".to_vec());
    }

    #[test]
    fn test_decode_without_padding() {
        assert_eq!(decode("MY"), vec![0x66]);
        assert_eq!(decode("MZXW6YQ"), vec![0x66, 0x6F, 0x6F, 0x62]);
        assert_eq!(decode("MZXW6YTBOI"), b"foobar".to_vec());
    }

    #[test]
    fn test_decode_partial_block() {
        // A single character cannot complete an octet
        assert!(decode("M").is_empty());
        // Three characters complete one octet, the 15th bit is dangling
        assert_eq!(decode("MZX"), vec![0x66]);
    }

    #[test]
    fn test_decode_invalid_character() {
        assert!(decode("").is_empty());
        assert!(decode("!!!!!!!!").is_empty());
        // '1' is outside the alphabet: stops after the first group
        assert_eq!(decode("MZXW6YTB1ZXW6YTB"), b"fooba".to_vec());
    }

    #[test]
    fn test_decode_lower_case() {
        assert_eq!(decode("mzxw6ytboi"), b"foobar".to_vec());
    }

    #[test]
    fn test_roundtrip_against_data_encoding() {
        let data: Vec<u8> = (0u8..=255).collect();
        for len in 0..64 {
            let plain = &data[len..len * 3];
            let coded = encode(plain);
            assert_eq!(coded, data_encoding::BASE32.encode(plain));
            assert_eq!(decode(&coded), plain);
            assert_eq!(decode(coded.trim_end_matches('=')), plain);
        }
    }

    #[test]
    fn test_lengths() {
        assert_eq!(encoded_len(0), 0);
        assert_eq!(encoded_len(1), 8);
        assert_eq!(encoded_len(5), 8);
        assert_eq!(encoded_len(6), 16);
        assert_eq!(decoded_capacity(15), 5);
        assert_eq!(decoded_capacity(16), 10);
    }
}
