// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
//! Durable persistence for prompts, sessions, events, and compactions.
//!
//! One SQLite database owns all state; the in-memory `Session` view in
//! `runa-core` is a cache over this crate.  Every write is transactional and
//! durable before the call returns.

mod error;
mod records;
mod store;

pub use error::StoreError;
pub use records::{
    CompactionRecord, EventRecord, NewEvent, RequestParams, SessionRecord, SessionStatus,
};
pub use store::Store;
