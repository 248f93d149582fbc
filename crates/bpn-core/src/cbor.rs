//! Minimal CBOR wire primitives for bundle codecs.
//!
//! Only the subset of RFC 8949 the Bundle Protocol uses: unsigned integers,
//! byte strings, definite and indefinite arrays, and the break byte. Encoding
//! always emits the shortest form, which RFC 9171 requires.

use crate::error::CborError;

pub const MAJOR_UINT: u8 = 0;
pub const MAJOR_BYTES: u8 = 2;
pub const MAJOR_ARRAY: u8 = 4;

/// Start byte of an indefinite-length array.
pub const INDEFINITE_ARRAY_START: u8 = 0x9f;
/// The "break" stop code terminating an indefinite-length item.
pub const BREAK: u8 = 0xff;

/// Append a CBOR head (major type + argument) in shortest form.
pub fn encode_head(out: &mut Vec<u8>, major: u8, value: u64) {
    let mt = major << 5;
    if value < 24 {
        out.push(mt | value as u8);
    } else if value <= u8::MAX as u64 {
        out.push(mt | 24);
        out.push(value as u8);
    } else if value <= u16::MAX as u64 {
        out.push(mt | 25);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= u32::MAX as u64 {
        out.push(mt | 26);
        out.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        out.push(mt | 27);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Append an unsigned integer.
pub fn encode_uint(out: &mut Vec<u8>, value: u64) {
    encode_head(out, MAJOR_UINT, value);
}

/// Append a definite-length byte string.
pub fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    encode_head(out, MAJOR_BYTES, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Append a definite-length array head for `len` elements.
pub fn encode_array_head(out: &mut Vec<u8>, len: u64) {
    encode_head(out, MAJOR_ARRAY, len);
}

/// A forward-only cursor over a CBOR-encoded byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset into the input.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes remaining after the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Peek the next raw byte without consuming it.
    pub fn peek(&self) -> Result<u8, CborError> {
        self.buf.get(self.pos).copied().ok_or(CborError::UnexpectedEof {
            offset: self.pos,
            need: 1,
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CborError> {
        if self.remaining() < n {
            return Err(CborError::UnexpectedEof {
                offset: self.pos,
                need: n - self.remaining(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Decode a head, returning `(major, argument)`. Indefinite lengths are rejected.
    pub fn read_head(&mut self) -> Result<(u8, u64), CborError> {
        let initial = self.take(1)?[0];
        let major = initial >> 5;
        let info = initial & 0x1f;
        let value = match info {
            0..=23 => info as u64,
            24 => self.take(1)?[0] as u64,
            25 => u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as u64,
            26 => u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as u64,
            27 => u64::from_be_bytes(self.take(8)?.try_into().unwrap()),
            31 => return Err(CborError::UnexpectedIndefiniteLength),
            _ => return Err(CborError::InvalidAdditionalInfo(info)),
        };
        Ok((major, value))
    }

    fn expect_major(&mut self, expected: u8) -> Result<u64, CborError> {
        let (major, value) = self.read_head()?;
        if major != expected {
            return Err(CborError::WrongMajorType {
                expected,
                actual: major,
            });
        }
        Ok(value)
    }

    /// Decode an unsigned integer.
    pub fn read_uint(&mut self) -> Result<u64, CborError> {
        self.expect_major(MAJOR_UINT)
    }

    /// Decode a definite-length byte string, borrowing from the input.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], CborError> {
        let len = self.expect_major(MAJOR_BYTES)?;
        if len > self.remaining() as u64 {
            return Err(CborError::LengthOverrun {
                len,
                remaining: self.remaining(),
            });
        }
        self.take(len as usize)
    }

    /// Decode a definite-length array head, returning the element count.
    pub fn read_array_head(&mut self) -> Result<u64, CborError> {
        self.expect_major(MAJOR_ARRAY)
    }

    /// Consume the start byte of an indefinite-length array.
    pub fn read_indefinite_array_start(&mut self) -> Result<(), CborError> {
        let b = self.take(1)?[0];
        if b != INDEFINITE_ARRAY_START {
            return Err(CborError::WrongMajorType {
                expected: MAJOR_ARRAY,
                actual: b >> 5,
            });
        }
        Ok(())
    }

    /// Consume a break byte.
    pub fn read_break(&mut self) -> Result<(), CborError> {
        let b = self.take(1)?[0];
        if b != BREAK {
            return Err(CborError::ExpectedBreak);
        }
        Ok(())
    }

    /// Whether the next byte is the break stop code.
    #[must_use]
    pub fn at_break(&self) -> bool {
        self.buf.get(self.pos) == Some(&BREAK)
    }

    /// Skip one complete data item (head plus any payload or nested items).
    pub fn skip_item(&mut self) -> Result<(), CborError> {
        let start = self.pos;
        let (major, value) = self.read_head()?;
        match major {
            MAJOR_UINT | 1 | 7 => {}
            MAJOR_BYTES | 3 => {
                if value > self.remaining() as u64 {
                    self.pos = start;
                    return Err(CborError::LengthOverrun {
                        len: value,
                        remaining: self.buf.len() - start,
                    });
                }
                self.pos += value as usize;
            }
            MAJOR_ARRAY => {
                for _ in 0..value {
                    self.skip_item()?;
                }
            }
            5 => {
                for _ in 0..value.saturating_mul(2) {
                    self.skip_item()?;
                }
            }
            _ => return Err(CborError::InvalidAdditionalInfo(value as u8)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_shortest_forms() {
        let cases: &[(u64, &[u8])] = &[
            (0, &[0x00]),
            (10, &[0x0a]),
            (23, &[0x17]),
            (24, &[0x18, 0x18]),
            (255, &[0x18, 0xff]),
            (256, &[0x19, 0x01, 0x00]),
            (65535, &[0x19, 0xff, 0xff]),
            (65536, &[0x1a, 0x00, 0x01, 0x00, 0x00]),
            (u32::MAX as u64, &[0x1a, 0xff, 0xff, 0xff, 0xff]),
            (
                u64::MAX,
                &[0x1b, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
            ),
        ];
        for (value, expected) in cases {
            let mut out = Vec::new();
            encode_uint(&mut out, *value);
            assert_eq!(out.as_slice(), *expected, "encoding of {value}");

            let mut rd = Reader::new(&out);
            assert_eq!(rd.read_uint().unwrap(), *value);
            assert_eq!(rd.remaining(), 0);
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let data = [0xde, 0xad, 0xbe, 0xef];
        let mut out = Vec::new();
        encode_bytes(&mut out, &data);
        assert_eq!(out[0], 0x44); // major 2, len 4

        let mut rd = Reader::new(&out);
        assert_eq!(rd.read_bytes().unwrap(), &data);
    }

    #[test]
    fn test_array_head() {
        let mut out = Vec::new();
        encode_array_head(&mut out, 3);
        assert_eq!(out, [0x83]);

        let mut rd = Reader::new(&out);
        assert_eq!(rd.read_array_head().unwrap(), 3);
    }

    #[test]
    fn test_indefinite_array_and_break() {
        let buf = [INDEFINITE_ARRAY_START, 0x01, 0x02, BREAK];
        let mut rd = Reader::new(&buf);
        rd.read_indefinite_array_start().unwrap();
        assert_eq!(rd.read_uint().unwrap(), 1);
        assert!(!rd.at_break());
        assert_eq!(rd.read_uint().unwrap(), 2);
        assert!(rd.at_break());
        rd.read_break().unwrap();
        assert_eq!(rd.remaining(), 0);
    }

    #[test]
    fn test_wrong_major_type() {
        let mut out = Vec::new();
        encode_uint(&mut out, 5);
        let mut rd = Reader::new(&out);
        assert_eq!(
            rd.read_bytes(),
            Err(CborError::WrongMajorType {
                expected: MAJOR_BYTES,
                actual: MAJOR_UINT
            })
        );
    }

    #[test]
    fn test_truncated_input() {
        // head promises a u16 argument but only one byte follows
        let buf = [0x19, 0x01];
        let mut rd = Reader::new(&buf);
        assert!(matches!(
            rd.read_uint(),
            Err(CborError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_byte_string_length_overrun() {
        let buf = [0x58, 0x20, 0x00]; // promises 32 bytes, has 1
        let mut rd = Reader::new(&buf);
        assert!(matches!(rd.read_bytes(), Err(CborError::LengthOverrun { .. })));
    }

    #[test]
    fn test_skip_item_nested() {
        let mut out = Vec::new();
        encode_array_head(&mut out, 2);
        encode_uint(&mut out, 7);
        encode_bytes(&mut out, &[1, 2, 3]);
        encode_uint(&mut out, 42);

        let mut rd = Reader::new(&out);
        rd.skip_item().unwrap(); // the whole array
        assert_eq!(rd.read_uint().unwrap(), 42);
    }
}
