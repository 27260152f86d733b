// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use async_trait::async_trait;

use crate::observability::EngineEvent;

/// Structured event consumer. Delivery here is best effort; the persistence
/// outbox guarantees eventual delivery, so implementations should not block
/// or fail the caller.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &EngineEvent);
}
