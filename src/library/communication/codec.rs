//! Encoding and decoding of untagged payloads
//!
//! The wire format carries no type information. A receiver has to know which [`PayloadShape`]
//! to expect from the address a message arrived on. Numeric shapes are fixed-width and
//! little-endian on every peer regardless of the host architecture, text is passed through as
//! raw UTF-8 without a length prefix (the frame length is the text length).

use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

const NUMERIC_WIDTH: usize = 4;

/// Expected layout of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PayloadShape {
    /// 32-bit signed integer, 4 bytes little-endian
    Int32,
    /// IEEE-754 single precision, 4 bytes little-endian
    Float32,
    /// UTF-8 text of any length
    Text,
}

impl PayloadShape {
    /// Exact byte length required by the shape, `None` for variable length shapes
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            PayloadShape::Int32 | PayloadShape::Float32 => Some(NUMERIC_WIDTH),
            PayloadShape::Text => None,
        }
    }
}

impl Display for PayloadShape {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decoded payload value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Payload {
    /// Signed integer measurement
    Int32(i32),
    /// Floating point value
    Float32(f32),
    /// Human readable text
    Text(String),
}

impl Payload {
    /// Shape this value is encoded with
    pub fn shape(&self) -> PayloadShape {
        match self {
            Payload::Int32(_) => PayloadShape::Int32,
            Payload::Float32(_) => PayloadShape::Float32,
            Payload::Text(_) => PayloadShape::Text,
        }
    }

    /// Serializes the value into its wire representation
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Payload::Int32(value) => value.to_le_bytes().to_vec(),
            Payload::Float32(value) => value.to_le_bytes().to_vec(),
            Payload::Text(value) => value.as_bytes().to_vec(),
        }
    }

    /// Parses raw bytes with the expected shape
    ///
    /// Never coerces: a numeric buffer that is not exactly four bytes long is rejected.
    pub fn decode(shape: PayloadShape, bytes: &[u8]) -> Result<Self, MalformedPayload> {
        match shape {
            PayloadShape::Int32 => Ok(Payload::Int32(i32::from_le_bytes(fixed(shape, bytes)?))),
            PayloadShape::Float32 => {
                Ok(Payload::Float32(f32::from_le_bytes(fixed(shape, bytes)?)))
            }
            PayloadShape::Text => std::str::from_utf8(bytes)
                .map(|text| Payload::Text(text.to_owned()))
                .map_err(|_| MalformedPayload::InvalidText {
                    actual: bytes.len(),
                }),
        }
    }

    /// Integer content, if any
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Payload::Int32(value) => Some(*value),
            _ => None,
        }
    }

    /// Floating point content, if any
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Payload::Float32(value) => Some(*value),
            _ => None,
        }
    }

    /// Text content, if any
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl Display for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Int32(value) => write!(f, "{}", value),
            Payload::Float32(value) => write!(f, "{}", value),
            Payload::Text(value) => write!(f, "{:?}", value),
        }
    }
}

fn fixed(shape: PayloadShape, bytes: &[u8]) -> Result<[u8; NUMERIC_WIDTH], MalformedPayload> {
    <[u8; NUMERIC_WIDTH]>::try_from(bytes).map_err(|_| MalformedPayload::LengthMismatch {
        shape,
        expected: NUMERIC_WIDTH,
        actual: bytes.len(),
    })
}

/// Payload that does not match the shape expected on its address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPayload {
    /// Numeric payload of the wrong width
    #[error("malformed {shape} payload: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Shape the receiver expected
        shape: PayloadShape,
        /// Required byte length
        expected: usize,
        /// Received byte length
        actual: usize,
    },
    /// Text payload which is not valid UTF-8
    #[error("malformed text payload: {actual} bytes of invalid UTF-8")]
    InvalidText {
        /// Received byte length
        actual: usize,
    },
}
