//! Byte-level encoding of remote-control messages
//!
//! A message is a 4-byte big-endian length (counting itself) followed by
//! one or more commands. A command starts with a one-byte length (counting
//! itself); commands longer than 255 bytes use a zero byte followed by a
//! 4-byte length instead. Then come the command id and its payload.

use crate::error::ConnectionError;
use crate::session::Value;

pub const TYPE_POSITION_2D: u8 = 0x01;
pub const TYPE_UBYTE: u8 = 0x07;
pub const TYPE_BYTE: u8 = 0x08;
pub const TYPE_INTEGER: u8 = 0x09;
pub const TYPE_DOUBLE: u8 = 0x0b;
pub const TYPE_STRING: u8 = 0x0c;
pub const TYPE_STRINGLIST: u8 = 0x0e;

pub const RTYPE_OK: u8 = 0x00;
pub const RTYPE_NOT_IMPLEMENTED: u8 = 0x01;
pub const RTYPE_ERR: u8 = 0xff;

/// Growable buffer for command payloads
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn f64(&mut self, value: f64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Length-prefixed UTF-8 string without a type tag
    pub fn string(&mut self, value: &str) -> &mut Self {
        self.i32(value.len() as i32);
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    pub fn typed_double(&mut self, value: f64) -> &mut Self {
        self.u8(TYPE_DOUBLE).f64(value)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Frame a single command
pub fn command(id: u8, payload: &[u8]) -> Vec<u8> {
    let short_len = payload.len() + 2;
    let mut out = Vec::with_capacity(short_len + 4);
    if short_len <= u8::MAX as usize {
        out.push(short_len as u8);
    } else {
        out.push(0);
        out.extend_from_slice(&((short_len + 4) as u32).to_be_bytes());
    }
    out.push(id);
    out.extend_from_slice(payload);
    out
}

/// Wrap framed commands into one message
pub fn message(commands: &[Vec<u8>]) -> Vec<u8> {
    let body_len: usize = commands.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(body_len + 4);
    out.extend_from_slice(&((body_len + 4) as u32).to_be_bytes());
    for cmd in commands {
        out.extend_from_slice(cmd);
    }
    out
}

/// Outcome reported by the status part of every response
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub command: u8,
    pub result: u8,
    pub description: String,
}

impl Status {
    /// Turn a non-OK status into an error
    pub fn check(self, expected_command: u8) -> Result<(), ConnectionError> {
        if self.command != expected_command {
            return Err(ConnectionError::protocol(format!(
                "status for command 0x{:02x}, expected 0x{:02x}",
                self.command, expected_command
            )));
        }
        match self.result {
            RTYPE_OK => Ok(()),
            RTYPE_NOT_IMPLEMENTED | RTYPE_ERR => Err(ConnectionError::Command {
                command: self.command,
                message: self.description,
            }),
            other => Err(ConnectionError::protocol(format!(
                "unknown status code 0x{:02x}",
                other
            ))),
        }
    }
}

/// Cursor over received bytes
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Consume everything left
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        slice
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ConnectionError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                ConnectionError::protocol(format!(
                    "need {} bytes at offset {}, only {} available",
                    len,
                    self.pos,
                    self.data.len().saturating_sub(self.pos)
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ConnectionError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ConnectionError> {
        Ok(self.take(1)?[0])
    }

    pub fn i8(&mut self) -> Result<i8, ConnectionError> {
        Ok(i8::from_be_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, ConnectionError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, ConnectionError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64, ConnectionError> {
        Ok(f64::from_be_bytes(self.array()?))
    }

    fn length(&mut self) -> Result<usize, ConnectionError> {
        let len = self.i32()?;
        usize::try_from(len)
            .map_err(|_| ConnectionError::protocol(format!("negative length {}", len)))
    }

    pub fn string(&mut self) -> Result<String, ConnectionError> {
        let len = self.length()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ConnectionError::protocol(format!("invalid utf-8 string: {}", e)))
    }

    pub fn string_list(&mut self) -> Result<Vec<String>, ConnectionError> {
        let count = self.length()?;
        (0..count).map(|_| self.string()).collect()
    }

    /// Read a type tag followed by a value of that type
    pub fn typed_value(&mut self) -> Result<Value, ConnectionError> {
        let tag = self.u8()?;
        match tag {
            TYPE_UBYTE => Ok(Value::UByte(self.u8()?)),
            TYPE_BYTE => Ok(Value::Integer(self.i8()? as i32)),
            TYPE_INTEGER => Ok(Value::Integer(self.i32()?)),
            TYPE_DOUBLE => Ok(Value::Double(self.f64()?)),
            TYPE_STRING => Ok(Value::String(self.string()?)),
            TYPE_STRINGLIST => Ok(Value::StringList(self.string_list()?)),
            TYPE_POSITION_2D => Ok(Value::Position2D {
                x: self.f64()?,
                y: self.f64()?,
            }),
            other => Err(ConnectionError::protocol(format!(
                "unsupported value type 0x{:02x}",
                other
            ))),
        }
    }

    /// Read a type tag and require it to be `expected`
    pub fn expect_type(&mut self, expected: u8) -> Result<(), ConnectionError> {
        let tag = self.u8()?;
        if tag != expected {
            return Err(ConnectionError::protocol(format!(
                "expected type 0x{:02x}, got 0x{:02x}",
                expected, tag
            )));
        }
        Ok(())
    }

    /// Split off the next framed command: its id and a decoder over its payload
    pub fn command(&mut self) -> Result<(u8, Decoder<'a>), ConnectionError> {
        let short_len = self.u8()?;
        let content_len = if short_len == 0 {
            let total = self.u32()? as usize;
            total
                .checked_sub(5)
                .ok_or_else(|| ConnectionError::protocol("extended command length too short"))?
        } else {
            short_len as usize - 1
        };
        if content_len == 0 {
            return Err(ConnectionError::protocol("command without id"));
        }
        let content = self.take(content_len)?;
        Ok((content[0], Decoder::new(&content[1..])))
    }

    /// Read the status command that leads every response
    pub fn status(&mut self) -> Result<Status, ConnectionError> {
        let (command, mut body) = self.command()?;
        Ok(Status {
            command,
            result: body.u8()?,
            description: body.string()?,
        })
    }
}
