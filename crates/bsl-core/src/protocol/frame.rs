//! ROM BSL frame encoding.
//!
//! Command frame layout (all words little-endian):
//!
//! ```text
//! 0x80 CMD L1 L2 AL AH LL LH [payload] CKL CKH
//! ```
//!
//! `L1 == L2` is the number of bytes between `L2` and the checksum, i.e.
//! four header bytes plus the payload. The checksum is the inverted XOR of
//! all preceding bytes taken as 16-bit words.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::*;
use crate::profile::ERASED;

/// One command frame, already aligned to even address and length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: u8,
    address: u16,
    length: u16,
    payload: Vec<u8>,
}

impl Frame {
    /// Frame without payload; `length` is carried in the LL/LH field.
    pub fn command(opcode: u8, address: u16, length: u16) -> Self {
        Self {
            opcode,
            address,
            length,
            payload: Vec::new(),
        }
    }

    /// TX_BLOCK, padded with 0xFF to an even start address and length.
    pub fn block_write(address: u16, data: &[u8]) -> Self {
        let mut address = address;
        let mut payload = Vec::with_capacity(data.len() + 2);
        if address % 2 != 0 {
            address -= 1;
            payload.push(ERASED);
        }
        payload.extend_from_slice(data);
        if payload.len() % 2 != 0 {
            payload.push(ERASED);
        }

        Self {
            opcode: BSL_TX_BLOCK,
            address,
            length: payload.len() as u16,
            payload,
        }
    }

    /// RX_BLOCK, widened to an even start address and length.
    ///
    /// The reply then starts one byte early for odd addresses; see
    /// [`Frame::read_skew`].
    pub fn block_read(address: u16, length: u16) -> Self {
        let mut address = address;
        let mut length = length;
        if address % 2 != 0 {
            address -= 1;
            length += 1;
        }
        if length % 2 != 0 {
            length += 1;
        }
        Self::command(BSL_RX_BLOCK, address, length)
    }

    /// TX_PASSWORD carrying interrupt vector bytes for `address`.
    pub fn password(address: u16, data: &[u8]) -> Self {
        Self {
            opcode: BSL_TX_PASSWORD,
            address,
            length: data.len() as u16,
            payload: data.to_vec(),
        }
    }

    /// The password of an erased device.
    pub fn erased_password() -> Self {
        Self::password(PASSWORD_ADDR, &[ERASED; PASSWORD_LEN])
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Leading bytes a block read returns before the requested address.
    pub fn read_skew(requested: u16) -> usize {
        (requested % 2) as usize
    }

    /// Whether the opcode carries a data payload on the wire.
    fn carries_payload(&self) -> bool {
        matches!(self.opcode, BSL_TX_BLOCK | BSL_TX_PASSWORD)
    }

    /// Serialize to wire bytes, checksum included.
    pub fn encode(&self) -> Vec<u8> {
        let payload: &[u8] = if self.carries_payload() {
            &self.payload
        } else {
            &[]
        };
        let body_len = 4 + payload.len();
        debug_assert!(
            body_len <= u8::MAX as usize,
            "frame body of {} bytes exceeds the L1/L2 field",
            body_len
        );

        let mut buf = vec![0u8; FRAME_HEADER_LEN + payload.len() + 2];
        buf[0] = BSL_SYNC;
        buf[1] = self.opcode;
        buf[2] = body_len as u8;
        buf[3] = body_len as u8;
        LittleEndian::write_u16(&mut buf[4..6], self.address);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + payload.len()].copy_from_slice(payload);

        let end = buf.len() - 2;
        let ck = checksum(&buf[..end]);
        LittleEndian::write_u16(&mut buf[end..], ck);
        buf
    }

    /// RAM word a checksum-bug BSL may overwrite while handling this frame.
    pub fn bug_access_address(&self) -> u16 {
        let wire = self.encode();
        let ck = LittleEndian::read_u16(&wire[wire.len() - 2..]);
        0x0212u16.wrapping_add(ck ^ 0xFFFF) & 0xFFFE
    }
}

/// Inverted XOR over little-endian 16-bit words. An odd trailing byte is
/// treated as the low half of a final word.
pub fn checksum(bytes: &[u8]) -> u16 {
    let xor = bytes.chunks(2).fold(0u16, |acc, pair| {
        let word = match pair {
            [lo, hi] => u16::from_le_bytes([*lo, *hi]),
            [lo] => *lo as u16,
            _ => 0,
        };
        acc ^ word
    });
    !xor
}

/// Reasons a data frame from the device is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataFrameError {
    BadHeader(u8),
    LengthMismatch { l1: u8, l2: u8 },
    Checksum { expected: u16, actual: u16 },
    Truncated,
}

/// Decode a complete data reply `[0x80, x, L1, L2, data.., CKL, CKH]`.
pub fn decode_data_frame(frame: &[u8]) -> Result<Vec<u8>, DataFrameError> {
    if frame.len() < 6 {
        return Err(DataFrameError::Truncated);
    }
    if frame[0] != DATA_FRAME {
        return Err(DataFrameError::BadHeader(frame[0]));
    }
    let (l1, l2) = (frame[2], frame[3]);
    if l1 != l2 {
        return Err(DataFrameError::LengthMismatch { l1, l2 });
    }
    let data_end = 4 + l1 as usize;
    if frame.len() != data_end + 2 {
        return Err(DataFrameError::Truncated);
    }

    let expected = checksum(&frame[..data_end]);
    let actual = LittleEndian::read_u16(&frame[data_end..]);
    if expected != actual {
        return Err(DataFrameError::Checksum { expected, actual });
    }
    Ok(frame[4..data_end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odd_address_write_alignment() {
        let frame = Frame::block_write(0x2001, &[1, 2, 3, 4, 5]);
        assert_eq!(frame.address(), 0x2000);
        assert_eq!(frame.length(), 6);
        assert_eq!(frame.payload(), &[0xFF, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_odd_length_write_padding() {
        let frame = Frame::block_write(0x2000, &[1, 2, 3]);
        assert_eq!(frame.address(), 0x2000);
        assert_eq!(frame.payload(), &[1, 2, 3, 0xFF]);

        let frame = Frame::block_write(0x2001, &[1, 2]);
        assert_eq!(frame.payload(), &[0xFF, 1, 2, 0xFF]);
        assert_eq!(frame.length(), 4);
    }

    #[test]
    fn test_block_read_alignment() {
        let frame = Frame::block_read(0x0FF1, 13);
        assert_eq!(frame.address(), 0x0FF0);
        assert_eq!(frame.length(), 14);
        assert_eq!(Frame::read_skew(0x0FF1), 1);

        let frame = Frame::block_read(0x1000, 3);
        assert_eq!(frame.length(), 4);
    }

    #[test]
    fn test_encode_command() {
        let wire = Frame::command(BSL_MASS_ERASE, MASS_ERASE_ADDR, MASS_ERASE_KEY).encode();
        assert_eq!(&wire[..8], &[0x80, 0x18, 0x04, 0x04, 0x00, 0xFF, 0x06, 0xA5]);
        assert_eq!(wire.len(), 10);
        // XOR of every word, checksum included, is all ones.
        assert_eq!(checksum(&wire), 0x0000);
    }

    #[test]
    fn test_encode_password() {
        let wire = Frame::erased_password().encode();
        assert_eq!(wire.len(), 8 + 32 + 2);
        assert_eq!(wire[2], 36);
        assert_eq!(wire[3], 36);
        assert_eq!(&wire[4..8], &[0xE0, 0xFF, 0x20, 0x00]);
    }

    #[test]
    fn test_payload_not_sent_for_commands() {
        let frame = Frame::command(BSL_MEM_OFFSET, 0, 1);
        assert_eq!(frame.encode().len(), 10);
    }

    #[test]
    fn test_decode_data_frame() {
        let mut reply = vec![0x80, 0x00, 0x04, 0x04, 0xF1, 0x49, 0x01, 0x10];
        let ck = checksum(&reply);
        reply.extend_from_slice(&ck.to_le_bytes());
        assert_eq!(decode_data_frame(&reply).unwrap(), vec![0xF1, 0x49, 0x01, 0x10]);

        let mut corrupt = reply.clone();
        corrupt[5] ^= 0x01;
        assert!(matches!(
            decode_data_frame(&corrupt),
            Err(DataFrameError::Checksum { .. })
        ));

        let mut mismatched = reply;
        mismatched[3] = 0x06;
        assert!(matches!(
            decode_data_frame(&mismatched),
            Err(DataFrameError::LengthMismatch { l1: 4, l2: 6 })
        ));
    }

    #[test]
    fn test_bug_access_address_is_even() {
        let frame = Frame::block_read(0x0FF0, 14);
        assert_eq!(frame.bug_access_address() % 2, 0);
    }

    #[test]
    fn test_largest_block_fits_length_field() {
        let wire = Frame::block_write(0xF000, &[0x55; MAX_DATA_BYTES]).encode();
        assert_eq!(wire[2] as usize, MAX_DATA_BYTES + 4);
        assert_eq!(wire[2], wire[3]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "exceeds the L1/L2 field")]
    fn test_oversized_block_panics() {
        Frame::block_write(0xF000, &[0x55; 256]).encode();
    }
}
