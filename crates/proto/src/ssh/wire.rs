//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Helpers for the primitive types every SSH message is built from:
//! `byte`, `boolean`, `uint32`, `string` and `name-list`.

use bytes::{BufMut, BytesMut};
use sshbind_platform::{SshError, SshResult};

/// Sequential reader over a message payload.
///
/// Every read error is a [`SshError::Dispatch`]: a payload that does not
/// match its declared layout means the message cannot be decoded.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Returns the current read offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> SshResult<u8> {
        let byte = *self.data.get(self.offset).ok_or_else(|| {
            SshError::Dispatch(format!("Cannot read byte at offset {}", self.offset))
        })?;
        self.offset += 1;
        Ok(byte)
    }

    /// Reads a boolean (any non-zero byte is TRUE).
    pub fn read_bool(&mut self) -> SshResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn read_u32(&mut self) -> SshResult<u32> {
        if self.offset + 4 > self.data.len() {
            return Err(SshError::Dispatch(format!(
                "Cannot read uint32 at offset {}",
                self.offset
            )));
        }

        let value = u32::from_be_bytes([
            self.data[self.offset],
            self.data[self.offset + 1],
            self.data[self.offset + 2],
            self.data[self.offset + 3],
        ]);
        self.offset += 4;

        Ok(value)
    }

    /// Reads a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> SshResult<Vec<u8>> {
        let length = self.read_u32()? as usize;

        if self.offset + length > self.data.len() {
            return Err(SshError::Dispatch(format!(
                "Data truncated: expected {} bytes at offset {}",
                length, self.offset
            )));
        }

        let bytes = self.data[self.offset..self.offset + length].to_vec();
        self.offset += length;

        Ok(bytes)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> SshResult<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| SshError::Dispatch("String contains invalid UTF-8".to_string()))
    }

    /// Reads a comma-separated name-list.
    pub fn read_name_list(&mut self) -> SshResult<Vec<String>> {
        let list = self.read_string()?;
        if list.is_empty() {
            Ok(vec![])
        } else {
            Ok(list.split(',').map(String::from).collect())
        }
    }

    /// Consumes and returns everything that has not been read yet.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.data[self.offset..].to_vec();
        self.offset = self.data.len();
        rest
    }
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Writes a length-prefixed byte string.
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes a boolean.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

/// Writes a comma-separated name-list.
pub fn write_name_list<S: AsRef<str>>(buf: &mut BytesMut, names: &[S]) {
    let list = names
        .iter()
        .map(|name| name.as_ref())
        .collect::<Vec<_>>()
        .join(",");
    write_string(buf, &list);
}
