//! Typed parameter blocks
//!
//! Job parameters are opaque to the framework. Handlers that want typed
//! arguments use this tagged encoding: one tag byte, then the value in
//! little-endian order. Byte strings carry a `u32` length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamType {
    Bool = 0,
    Int8 = 1,
    Uint8 = 2,
    Int32 = 3,
    Uint32 = 4,
    Int64 = 5,
    Uint64 = 6,
    Double = 7,
    VarUint8 = 8,
}

impl ParamType {
    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Bool,
            1 => Self::Int8,
            2 => Self::Uint8,
            3 => Self::Int32,
            4 => Self::Uint32,
            5 => Self::Int64,
            6 => Self::Uint64,
            7 => Self::Double,
            8 => Self::VarUint8,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarshalError {
    #[error("expected {expected:?}, found tag {found}")]
    TypeMismatch { expected: ParamType, found: u8 },
    #[error("parameter block truncated")]
    Truncated,
}

/// Builds a parameter block
#[derive(Debug, Default)]
pub struct ParamWriter {
    buf: BytesMut,
}

impl ParamWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(ParamType::Bool as u8);
        self.buf.put_u8(u8::from(v));
        self
    }

    pub fn put_i8(&mut self, v: i8) -> &mut Self {
        self.buf.put_u8(ParamType::Int8 as u8);
        self.buf.put_i8(v);
        self
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(ParamType::Uint8 as u8);
        self.buf.put_u8(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_u8(ParamType::Int32 as u8);
        self.buf.put_i32_le(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u8(ParamType::Uint32 as u8);
        self.buf.put_u32_le(v);
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_u8(ParamType::Int64 as u8);
        self.buf.put_i64_le(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u8(ParamType::Uint64 as u8);
        self.buf.put_u64_le(v);
        self
    }

    pub fn put_f64(&mut self, v: f64) -> &mut Self {
        self.buf.put_u8(ParamType::Double as u8);
        self.buf.put_f64_le(v);
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_u8(ParamType::VarUint8 as u8);
        self.buf.put_u32_le(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over a parameter block
#[derive(Debug, Clone)]
pub struct ParamReader {
    src: Bytes,
}

impl ParamReader {
    #[must_use]
    pub const fn new(src: Bytes) -> Self {
        Self { src }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.src.len()
    }

    fn check(&self, ty: ParamType, width: usize) -> Result<(), MarshalError> {
        let &tag = self.src.first().ok_or(MarshalError::Truncated)?;
        if ParamType::from_tag(tag) != Some(ty) {
            return Err(MarshalError::TypeMismatch {
                expected: ty,
                found: tag,
            });
        }
        if self.src.len() < 1 + width {
            return Err(MarshalError::Truncated);
        }
        Ok(())
    }

    fn expect(&mut self, ty: ParamType, width: usize) -> Result<(), MarshalError> {
        self.check(ty, width)?;
        self.src.advance(1);
        Ok(())
    }

    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`; the cursor does not move on error.
    pub fn get_bool(&mut self) -> Result<bool, MarshalError> {
        self.expect(ParamType::Bool, 1)?;
        Ok(self.src.get_u8() != 0)
    }

    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`.
    pub fn get_i8(&mut self) -> Result<i8, MarshalError> {
        self.expect(ParamType::Int8, 1)?;
        Ok(self.src.get_i8())
    }

    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`.
    pub fn get_u8(&mut self) -> Result<u8, MarshalError> {
        self.expect(ParamType::Uint8, 1)?;
        Ok(self.src.get_u8())
    }

    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`.
    pub fn get_i32(&mut self) -> Result<i32, MarshalError> {
        self.expect(ParamType::Int32, 4)?;
        Ok(self.src.get_i32_le())
    }

    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`.
    pub fn get_u32(&mut self) -> Result<u32, MarshalError> {
        self.expect(ParamType::Uint32, 4)?;
        Ok(self.src.get_u32_le())
    }

    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`.
    pub fn get_i64(&mut self) -> Result<i64, MarshalError> {
        self.expect(ParamType::Int64, 8)?;
        Ok(self.src.get_i64_le())
    }

    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`.
    pub fn get_u64(&mut self) -> Result<u64, MarshalError> {
        self.expect(ParamType::Uint64, 8)?;
        Ok(self.src.get_u64_le())
    }

    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`.
    pub fn get_f64(&mut self) -> Result<f64, MarshalError> {
        self.expect(ParamType::Double, 8)?;
        Ok(self.src.get_f64_le())
    }

    /// Read a length-prefixed byte string without copying.
    ///
    /// # Errors
    ///
    /// `TypeMismatch` or `Truncated`.
    pub fn get_bytes(&mut self) -> Result<Bytes, MarshalError> {
        self.check(ParamType::VarUint8, 4)?;
        let len = (&self.src[1..5]).get_u32_le() as usize;
        if self.src.len() < 5 + len {
            return Err(MarshalError::Truncated);
        }
        self.src.advance(5);
        Ok(self.src.split_to(len))
    }
}
