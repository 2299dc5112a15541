//! Little-endian wire encodings used by every command payload and EEPROM cell.
//!
//! Floats are IEEE-754 single precision. A NaN bit pattern is how the device
//! reports an erased (never written) EEPROM cell, so it decodes to `None`.

use crate::error::CodecError;

/// Bit pattern of an erased EEPROM cell.
pub const ERASED_F32: [u8; 4] = [0xff; 4];

pub fn encode_u16(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

pub fn encode_u32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn encode_f32(value: f32) -> [u8; 4] {
    value.to_le_bytes()
}

/// `None` is written as the erased pattern so it reads back as absent.
pub fn encode_opt_f32(value: Option<f32>) -> [u8; 4] {
    match value {
        Some(v) if !v.is_nan() => encode_f32(v),
        _ => ERASED_F32,
    }
}

pub fn decode_f32(bytes: [u8; 4]) -> Option<f32> {
    let value = f32::from_le_bytes(bytes);
    if value.is_nan() {
        None
    } else {
        Some(value)
    }
}

/// Sequential reader over a response payload.
#[derive(Debug)]
pub struct Decoder<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.offset + N;
        let slice = self.bytes.get(self.offset..end).ok_or(CodecError {
            offset: self.offset,
            needed: N,
            available: self.remaining(),
        })?;

        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.offset = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    /// NaN decodes to `None`.
    pub fn f32(&mut self) -> Result<Option<f32>, CodecError> {
        Ok(decode_f32(self.take()?))
    }

    /// Three consecutive floats, as returned by the sampler and measure commands.
    pub fn f32x3(&mut self) -> Result<[Option<f32>; 3], CodecError> {
        Ok([self.f32()?, self.f32()?, self.f32()?])
    }

    pub fn u16x3(&mut self) -> Result<[u16; 3], CodecError> {
        Ok([self.u16()?, self.u16()?, self.u16()?])
    }
}

/// Fixed-width ASCII field with trailing padding stripped.
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| *b as char)
        .collect::<String>()
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}
