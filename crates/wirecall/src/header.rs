//! Request and response headers exchanged ahead of every payload.

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;
use crate::free_list::Reset;

/// Header preceding every request body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Registered command identifier.
    pub command: u32,
    /// Client-chosen sequence number, unique among calls in flight.
    pub sequence: u32,
}

/// Header preceding every response body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Command echoed from the request.
    pub command: u32,
    /// Sequence number echoed from the request.
    pub sequence: u32,
    /// Zero on success.
    pub error: ErrorCode,
}

impl Reset for RequestHeader {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Reset for ResponseHeader {
    fn reset(&mut self) {
        *self = Self::default();
    }
}
