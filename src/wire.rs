// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Length-checked big-endian codec helpers shared by every wire message.
//!
//! All protocol messages use fixed big-endian layouts written by hand;
//! every message type implements [`WireEncode`] so that
//! `decode(encode(m)) == m` and `encoded_len(m) == encode(m).len()` hold.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encoding/decoding contract for wire messages.
pub(crate) trait WireEncode: Sized {
    /// Exact number of bytes `encode` will write.
    fn encoded_len(&self) -> usize;

    /// Append the serialized form to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Parse one value from the front of `buf`, consuming it.
    fn decode(buf: &mut Bytes) -> Result<Self>;

    /// Serialize into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf.freeze()
    }
}

/// Fail decoding unless at least `needed` bytes remain.
pub(crate) fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::FailedToParse(format!(
            "short read: {} needs {} bytes, {} available",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    ensure(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut Bytes, what: &str) -> Result<u16> {
    ensure(buf, 2, what)?;
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    ensure(buf, 4, what)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut Bytes, what: &str) -> Result<u64> {
    ensure(buf, 8, what)?;
    Ok(buf.get_u64())
}

pub(crate) fn get_i64(buf: &mut Bytes, what: &str) -> Result<i64> {
    ensure(buf, 8, what)?;
    Ok(buf.get_i64())
}

/// Read a `u16` length-prefixed byte string.
pub(crate) fn get_bytes(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    let len = get_u16(buf, what)? as usize;
    ensure(buf, len, what)?;
    Ok(buf.split_to(len))
}

/// Write a `u16` length-prefixed byte string.
pub(crate) fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

/// Read a `u16` length-prefixed UTF-8 string.
pub(crate) fn get_str(buf: &mut Bytes, what: &str) -> Result<String> {
    let bytes = get_bytes(buf, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::FailedToParse(format!("{}: invalid utf-8", what)))
}

pub(crate) fn str_len(s: &str) -> usize {
    2 + s.len()
}

/// CRC-16/CCITT-FALSE over `data`, as carried in the primary component
/// message checksum slot. The slot itself must be zero-filled before the
/// checksum is computed.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reads_are_errors() {
        let mut buf = Bytes::from_static(&[0x01, 0x02]);
        assert!(get_u32(&mut buf, "field").is_err());
        assert_eq!(get_u16(&mut buf, "field").unwrap(), 0x0102);
        assert!(get_u8(&mut buf, "field").is_err());
    }

    #[test]
    fn length_prefixed_round_trip() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, b"overlay");
        let mut bytes = buf.freeze();
        assert_eq!(get_str(&mut bytes, "s").unwrap(), "overlay");
        assert!(bytes.is_empty());
    }

    #[test]
    fn crc16_known_vector() {
        // CRC-16/CCITT-FALSE("123456789") == 0x29b1
        assert_eq!(crc16(b"123456789"), 0x29b1);
        assert_eq!(crc16(b""), 0xffff);
    }
}
