// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload exchanged with workers in both directions.

use bytes::Bytes;

/// A unit of work (or its result): opaque context plus opaque body.
///
/// The context usually carries headers or routing data encoded by the
/// caller, the body carries the request itself. Both are cheap to clone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Out-of-band data (headers, routing, control).
    pub context: Bytes,
    /// Request or response body.
    pub body: Bytes,
}

impl Payload {
    /// Create a payload from context and body.
    pub fn new(context: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            context: context.into(),
            body: body.into(),
        }
    }

    /// Create a payload with an empty context.
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self {
            context: Bytes::new(),
            body: body.into(),
        }
    }

    /// True when both context and body are empty.
    pub fn is_empty(&self) -> bool {
        self.context.is_empty() && self.body.is_empty()
    }

    /// Body as UTF-8, if valid.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Context as UTF-8, if valid.
    pub fn context_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.context).ok()
    }
}
