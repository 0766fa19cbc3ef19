// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! RPC message buffers
//!
//! A message travels through the kernel as the raw contents of a UTCB:
//!
//! ```text
//! +--------+------------+---------+
//! |  word  | local name | payload |
//! | i64 LE |   u64 LE   |  bytes  |
//! +--------+------------+---------+
//! ```
//!
//! `word` is the opcode of a request or the exception code of a reply.
//! `local name` is the badge the client believes it is calling; the server
//! checks it against the badge the kernel delivered.

use alloc::vec::Vec;
use core::fmt;

use crate::object::Badge;

use super::IpcError;

/// Size of the fixed message header
pub const HEADER_SIZE: usize = 16;

/// RPC function number
pub type Opcode = i64;

/// Result code carried in the first word of every reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExceptionCode(pub i64);

impl ExceptionCode {
    pub const SUCCESS: Self = Self(0);
    /// No object is registered under the called badge
    pub const INVALID_OBJECT: Self = Self(-1);
    /// The object does not implement the requested function
    pub const INVALID_OPCODE: Self = Self(-2);

    /// Application-defined exception `code`, numbered from 1
    pub const fn user(code: u32) -> Self {
        Self(code as i64 + 1)
    }

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SUCCESS => write!(f, "success"),
            Self::INVALID_OBJECT => write!(f, "invalid object"),
            Self::INVALID_OPCODE => write!(f, "invalid opcode"),
            Self(code) => write!(f, "exception {}", code),
        }
    }
}

/// Request or reply message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgBuf {
    word: i64,
    local_name: Badge,
    payload: Vec<u8>,
}

impl MsgBuf {
    /// Empty message with a zero word
    pub fn new() -> Self {
        Self::default()
    }

    /// Request for function `opcode`
    pub fn request(opcode: Opcode) -> Self {
        Self {
            word: opcode,
            ..Self::default()
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.word
    }

    pub fn exception(&self) -> ExceptionCode {
        ExceptionCode(self.word)
    }

    pub fn set_exception(&mut self, code: ExceptionCode) {
        self.word = code.0;
    }

    /// Badge the sender addressed
    pub fn local_name(&self) -> Badge {
        self.local_name
    }

    pub fn set_local_name(&mut self, badge: Badge) {
        self.local_name = badge;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Drop the payload, keeping the header
    pub fn clear_payload(&mut self) {
        self.payload.clear();
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.payload.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a length-prefixed byte string
    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u64(bytes.len() as u64);
        self.payload.extend_from_slice(bytes);
        self
    }

    /// Cursor over the payload
    pub fn reader(&self) -> MsgReader<'_> {
        MsgReader {
            payload: &self.payload,
            pos: 0,
        }
    }

    /// Size of the encoded message
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&self.word.to_le_bytes());
        bytes.extend_from_slice(&self.local_name.into_raw().to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IpcError> {
        if bytes.len() < HEADER_SIZE {
            return Err(IpcError::MalformedMessage);
        }
        let (word, rest) = bytes.split_at(8);
        let (name, payload) = rest.split_at(8);
        Ok(Self {
            word: i64::from_le_bytes(word.try_into().map_err(|_| IpcError::MalformedMessage)?),
            local_name: Badge::new(u64::from_le_bytes(
                name.try_into().map_err(|_| IpcError::MalformedMessage)?,
            )),
            payload: payload.to_vec(),
        })
    }
}

/// Sequential reader over a message payload
pub struct MsgReader<'a> {
    payload: &'a [u8],
    pos: usize,
}

impl<'a> MsgReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], IpcError> {
        let end = self.pos.checked_add(len).ok_or(IpcError::MalformedMessage)?;
        let bytes = self.payload.get(self.pos..end).ok_or(IpcError::MalformedMessage)?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64, IpcError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| IpcError::MalformedMessage)?))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], IpcError> {
        let len = usize::try_from(self.get_u64()?).map_err(|_| IpcError::MalformedMessage)?;
        self.take(len)
    }

    /// Bytes not read yet
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.pos
    }
}
