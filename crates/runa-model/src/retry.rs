// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{ChatProvider, CompletionRequest, EventStream, ModelError};

const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 30_000;

/// Call `provider.complete`, retrying transient failures with decorrelated
/// jitter.  Non-transient errors (invalid request, context overflow) return
/// immediately so the caller can react.
///
/// A server-supplied `Retry-After` takes precedence over the computed delay.
pub async fn complete_with_retry(
    provider: &dyn ChatProvider,
    req: CompletionRequest,
    max_retries: u32,
) -> Result<EventStream, ModelError> {
    let mut attempt = 0u32;
    loop {
        match provider.complete(req.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = match &e {
                    ModelError::RateLimited { retry_after: Some(d) } => *d,
                    _ => jittered_delay(attempt),
                };
                warn!(
                    provider = provider.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential backoff with full jitter, capped.
fn jittered_delay(attempt: u32) -> Duration {
    let ceiling = (BASE_DELAY_MS << attempt.min(6)).min(MAX_DELAY_MS);
    let ms = rand::thread_rng().gen_range(BASE_DELAY_MS..=ceiling.max(BASE_DELAY_MS + 1));
    Duration::from_millis(ms)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
