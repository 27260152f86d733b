// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use uuid::Uuid;

use crate::cache::PromptCache;
use crate::observability::{EngineEvent, EventKind, MetricsRegistry};
use crate::traits::{EventSink, Generator, GeneratorFailure, GeneratorOutput, GeneratorRequest, TokenUsage};

/// Generator wrapper that consults the prompt cache before dispatching.
///
/// A hit never reaches the inner generator and costs nothing; a miss
/// dispatches and, on success only, writes the response back. The wrapper is
/// built per run so cache events carry the run's identity.
pub struct CachedGenerator {
    inner: Arc<dyn Generator>,
    cache: Arc<PromptCache>,
    run_id: Uuid,
    masterplan_id: Uuid,
    sink: Arc<dyn EventSink>,
    metrics: MetricsRegistry,
}

impl CachedGenerator {
    pub fn new(
        inner: Arc<dyn Generator>,
        cache: Arc<PromptCache>,
        run_id: Uuid,
        masterplan_id: Uuid,
        sink: Arc<dyn EventSink>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            inner,
            cache,
            run_id,
            masterplan_id,
            sink,
            metrics,
        }
    }

    async fn emit(&self, kind: EventKind) {
        let event = EngineEvent::new(kind, self.run_id, self.masterplan_id);
        self.sink.publish(&event).await;
    }
}

#[async_trait]
impl Generator for CachedGenerator {
    async fn invoke(&self, request: GeneratorRequest) -> Result<GeneratorOutput, GeneratorFailure> {
        let started = Instant::now();

        if let Some(text) = self
            .cache
            .get(&request.model, request.temperature, &request.prompt)
        {
            self.metrics.observe(
                "llm_request_duration_ms",
                &[("cached", "true")],
                started.elapsed().as_millis() as f64,
            );
            self.emit(EventKind::CacheHit).await;
            return Ok(GeneratorOutput {
                text,
                usage: TokenUsage::default(),
                cost_usd: 0.0,
            });
        }

        self.emit(EventKind::CacheMiss).await;
        let model = request.model.clone();
        let temperature = request.temperature;
        let prompt = request.prompt.clone();

        let result = self.inner.invoke(request).await;
        self.metrics.observe(
            "llm_request_duration_ms",
            &[("cached", "false")],
            started.elapsed().as_millis() as f64,
        );

        match result {
            Ok(output) => {
                self.cache.put(
                    &model,
                    temperature,
                    &prompt,
                    output.text.clone(),
                    output.cost_usd,
                    self.masterplan_id,
                );
                Ok(output)
            }
            // Failure writes nothing: the next identical request must miss.
            Err(failure) => Err(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DEFAULT_PROMPT_TTL;
    use crate::traits::FailureKind;
    use std::sync::Mutex;
    use std::time::Duration;

    struct CountingGenerator {
        calls: Mutex<u32>,
        fail: bool,
    }

    #[async_trait]
    impl Generator for CountingGenerator {
        async fn invoke(
            &self,
            request: GeneratorRequest,
        ) -> Result<GeneratorOutput, GeneratorFailure> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(GeneratorFailure::new(FailureKind::TransportError, "down"));
            }
            Ok(GeneratorOutput {
                text: format!("answer to {}", request.prompt),
                usage: TokenUsage::default(),
                cost_usd: 0.4,
            })
        }
    }

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn publish(&self, _event: &EngineEvent) {}
    }

    fn wrapper(fail: bool) -> (CachedGenerator, Arc<CountingGenerator>, Arc<PromptCache>) {
        let inner = Arc::new(CountingGenerator {
            calls: Mutex::new(0),
            fail,
        });
        let cache = Arc::new(PromptCache::new(DEFAULT_PROMPT_TTL, MetricsRegistry::new()));
        let wrapper = CachedGenerator::new(
            inner.clone(),
            cache.clone(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Arc::new(NullSink),
            MetricsRegistry::new(),
        );
        (wrapper, inner, cache)
    }

    fn request() -> GeneratorRequest {
        GeneratorRequest {
            prompt: "build the parser".into(),
            model: "m".into(),
            temperature: 0.7,
            deadline: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn hit_skips_the_inner_generator_and_is_free() {
        let (wrapper, inner, _cache) = wrapper(false);

        let first = wrapper.invoke(request()).await.unwrap();
        assert_eq!(first.cost_usd, 0.4);
        let second = wrapper.invoke(request()).await.unwrap();
        assert_eq!(second.cost_usd, 0.0);
        assert_eq!(second.text, first.text);
        assert_eq!(*inner.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_call_writes_nothing() {
        let (wrapper, inner, cache) = wrapper(true);

        assert!(wrapper.invoke(request()).await.is_err());
        assert!(cache.is_empty());
        // The next identical request dispatches again.
        assert!(wrapper.invoke(request()).await.is_err());
        assert_eq!(*inner.calls.lock().unwrap(), 2);
    }
}
