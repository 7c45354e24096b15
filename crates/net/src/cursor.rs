//! Bounds-checked sequential reads and writes over byte buffers.
//!
//! Integers are little-endian unless a `_be` method is used. The envelope's
//! sequence numbers and type tags, and the 16-bit update counter of terse
//! object updates, are the only big-endian fields on the wire.

use glam::{DVec3, Quat, Vec3, Vec4};
use thiserror::Error;
use uuid::Uuid;

/// Cursor failure; always a malformed-packet condition for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CursorError {
    /// A read needed more bytes than remain.
    #[error("buffer underrun: needed {needed} bytes, {remaining} remaining")]
    BufferUnderrun {
        /// Bytes requested.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
    /// A write needed more room than remains.
    #[error("buffer overrun: needed {needed} bytes, {remaining} remaining")]
    BufferOverrun {
        /// Bytes requested.
        needed: usize,
        /// Room left in the buffer.
        remaining: usize,
    },
    /// A blob or string is too long for its length prefix.
    #[error("length {len} does not fit a prefix with maximum {max}")]
    LengthOverflow {
        /// Actual length.
        len: usize,
        /// Largest encodable length.
        max: usize,
    },
    /// Text field is not NUL-free UTF-8.
    #[error("string field is not NUL-free UTF-8")]
    InvalidString,
}

/// Sequential reader over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_le {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Read a little-endian `", stringify!($ty), "`.")]
            pub fn $name(&mut self) -> Result<$ty, CursorError> {
                let bytes = self.take(std::mem::size_of::<$ty>())?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        )*
    };
}

impl<'a> Reader<'a> {
    /// Start reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current read offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread tail of the buffer, without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Consume exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CursorError> {
        if n > self.remaining() {
            return Err(CursorError::BufferUnderrun {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.take(1)?[0])
    }

    /// Read a signed byte.
    pub fn read_i8(&mut self) -> Result<i8, CursorError> {
        Ok(self.read_u8()? as i8)
    }

    read_le! {
        read_u16 => u16,
        read_u32 => u32,
        read_u64 => u64,
        read_i16 => i16,
        read_i32 => i32,
        read_i64 => i64,
        read_f32 => f32,
        read_f64 => f64,
    }

    /// Read a big-endian `u16`.
    pub fn read_u16_be(&mut self) -> Result<u16, CursorError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian `u32`.
    pub fn read_u32_be(&mut self) -> Result<u32, CursorError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a boolean byte (any nonzero value is `true`).
    pub fn read_bool(&mut self) -> Result<bool, CursorError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a raw 16-byte identifier.
    pub fn read_uuid(&mut self) -> Result<Uuid, CursorError> {
        let b = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes(raw))
    }

    /// Read three `f32`s.
    pub fn read_vec3(&mut self) -> Result<Vec3, CursorError> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    /// Read three `f64`s.
    pub fn read_dvec3(&mut self) -> Result<DVec3, CursorError> {
        Ok(DVec3::new(self.read_f64()?, self.read_f64()?, self.read_f64()?))
    }

    /// Read four `f32`s.
    pub fn read_vec4(&mut self) -> Result<Vec4, CursorError> {
        Ok(Vec4::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }

    /// Read a unit quaternion sent as its `x, y, z` parts; `w` is rebuilt as
    /// the non-negative root.
    pub fn read_quat(&mut self) -> Result<Quat, CursorError> {
        let v = self.read_vec3()?;
        let w = (1.0 - v.length_squared()).max(0.0).sqrt();
        Ok(Quat::from_xyzw(v.x, v.y, v.z, w))
    }

    /// Read a blob with a 1-byte length prefix.
    pub fn read_blob1(&mut self) -> Result<&'a [u8], CursorError> {
        let len = usize::from(self.read_u8()?);
        self.take(len)
    }

    /// Read a blob with a 2-byte length prefix.
    pub fn read_blob2(&mut self) -> Result<&'a [u8], CursorError> {
        let len = usize::from(self.read_u16()?);
        self.take(len)
    }

    /// Read a short (1-byte prefixed) string.
    pub fn read_string1(&mut self) -> Result<String, CursorError> {
        let raw = self.read_blob1()?;
        decode_text(raw)
    }

    /// Read a long (2-byte prefixed) string such as chat text.
    pub fn read_string2(&mut self) -> Result<String, CursorError> {
        let raw = self.read_blob2()?;
        decode_text(raw)
    }
}

/// Strips the trailing NUL the wire format carries and rejects interior NULs.
fn decode_text(raw: &[u8]) -> Result<String, CursorError> {
    let body = raw.strip_suffix(&[0]).unwrap_or(raw);
    if body.contains(&0) {
        return Err(CursorError::InvalidString);
    }
    std::str::from_utf8(body)
        .map(str::to_owned)
        .map_err(|_| CursorError::InvalidString)
}

/// Sequential writer into a fixed, caller-owned buffer.
#[derive(Debug)]
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

macro_rules! write_le {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Write a little-endian `", stringify!($ty), "`.")]
            pub fn $name(&mut self, value: $ty) -> Result<(), CursorError> {
                self.put(&value.to_le_bytes())
            }
        )*
    };
}

impl<'a> Writer<'a> {
    /// Start writing at the beginning of `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Room left in the buffer.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The written prefix of the buffer.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    /// Copy `bytes` into the buffer.
    pub fn put(&mut self, bytes: &[u8]) -> Result<(), CursorError> {
        if bytes.len() > self.remaining() {
            return Err(CursorError::BufferOverrun {
                needed: bytes.len(),
                remaining: self.remaining(),
            });
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) -> Result<(), CursorError> {
        self.put(&[value])
    }

    /// Write a signed byte.
    pub fn write_i8(&mut self, value: i8) -> Result<(), CursorError> {
        self.write_u8(value as u8)
    }

    write_le! {
        write_u16 => u16,
        write_u32 => u32,
        write_u64 => u64,
        write_i16 => i16,
        write_i32 => i32,
        write_i64 => i64,
        write_f32 => f32,
        write_f64 => f64,
    }

    /// Write a big-endian `u16`.
    pub fn write_u16_be(&mut self, value: u16) -> Result<(), CursorError> {
        self.put(&value.to_be_bytes())
    }

    /// Write a big-endian `u32`.
    pub fn write_u32_be(&mut self, value: u32) -> Result<(), CursorError> {
        self.put(&value.to_be_bytes())
    }

    /// Write a boolean as `0` or `1`.
    pub fn write_bool(&mut self, value: bool) -> Result<(), CursorError> {
        self.write_u8(u8::from(value))
    }

    /// Write a raw 16-byte identifier.
    pub fn write_uuid(&mut self, value: &Uuid) -> Result<(), CursorError> {
        self.put(value.as_bytes())
    }

    /// Write three `f32`s.
    pub fn write_vec3(&mut self, value: Vec3) -> Result<(), CursorError> {
        self.write_f32(value.x)?;
        self.write_f32(value.y)?;
        self.write_f32(value.z)
    }

    /// Write three `f64`s.
    pub fn write_dvec3(&mut self, value: DVec3) -> Result<(), CursorError> {
        self.write_f64(value.x)?;
        self.write_f64(value.y)?;
        self.write_f64(value.z)
    }

    /// Write four `f32`s.
    pub fn write_vec4(&mut self, value: Vec4) -> Result<(), CursorError> {
        self.write_f32(value.x)?;
        self.write_f32(value.y)?;
        self.write_f32(value.z)?;
        self.write_f32(value.w)
    }

    /// Write a quaternion as the `x, y, z` parts of its normalized,
    /// non-negative-`w` form.
    pub fn write_quat(&mut self, value: Quat) -> Result<(), CursorError> {
        let q = value.normalize();
        let q = if q.w < 0.0 { -q } else { q };
        self.write_vec3(Vec3::new(q.x, q.y, q.z))
    }

    /// Write a blob with a 1-byte length prefix.
    pub fn write_blob1(&mut self, bytes: &[u8]) -> Result<(), CursorError> {
        let len = u8::try_from(bytes.len()).map_err(|_| CursorError::LengthOverflow {
            len: bytes.len(),
            max: usize::from(u8::MAX),
        })?;
        self.write_u8(len)?;
        self.put(bytes)
    }

    /// Write a blob with a 2-byte length prefix.
    pub fn write_blob2(&mut self, bytes: &[u8]) -> Result<(), CursorError> {
        let len = u16::try_from(bytes.len()).map_err(|_| CursorError::LengthOverflow {
            len: bytes.len(),
            max: usize::from(u16::MAX),
        })?;
        self.write_u16(len)?;
        self.put(bytes)
    }

    /// Write a short string; the length includes a trailing NUL.
    pub fn write_string1(&mut self, text: &str) -> Result<(), CursorError> {
        if text.is_empty() {
            return self.write_u8(0);
        }
        let len = check_text(text, usize::from(u8::MAX))?;
        self.write_u8(len as u8)?;
        self.put(text.as_bytes())?;
        self.write_u8(0)
    }

    /// Write a long string; the length includes a trailing NUL.
    pub fn write_string2(&mut self, text: &str) -> Result<(), CursorError> {
        if text.is_empty() {
            return self.write_u16(0);
        }
        let len = check_text(text, usize::from(u16::MAX))?;
        self.write_u16(len as u16)?;
        self.put(text.as_bytes())?;
        self.write_u8(0)
    }
}

/// Returns the on-wire length (text plus NUL) after validating `text`.
fn check_text(text: &str, max: usize) -> Result<usize, CursorError> {
    if text.as_bytes().contains(&0) {
        return Err(CursorError::InvalidString);
    }
    let len = text.len() + 1;
    if len > max {
        return Err(CursorError::LengthOverflow { len, max });
    }
    Ok(len)
}
