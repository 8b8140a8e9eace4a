//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use ai_gateway_rust::drivers::{ProviderClient, ProviderClientFactory, ProviderRequest, ProviderResponse};
use ai_gateway_rust::resilience::{BreakerRegistry, CircuitBreakerConfig, RetryPolicy};
use ai_gateway_rust::telemetry::InMemoryMetricsSink;
use ai_gateway_rust::types::{
    Capability, CredentialRef, EndpointKey, Message, ModelDescriptor, ModelStatus, OutputChoice,
    OutputPayload, ProviderOutput, Usage,
};
use ai_gateway_rust::config::TimeoutConfig;
use ai_gateway_rust::registry::ModelResolver;
use ai_gateway_rust::{Gateway, Provider, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const GROUP: &str = "staff";

pub fn staff() -> BTreeSet<String> {
    [GROUP.to_string()].into_iter().collect()
}

pub fn model(name: &str, provider: Provider, base: &str, caps: &[Capability]) -> ModelDescriptor {
    ModelDescriptor {
        name: name.into(),
        display_name: name.into(),
        provider,
        base_url: url::Url::parse(base).unwrap(),
        capabilities: caps.iter().copied().collect(),
        credential: CredentialRef::Static {
            key: "sk-test".into(),
        },
        status: ModelStatus::Active,
        allowed_groups: [GROUP.to_string()].into_iter().collect(),
        deployment: None,
        api_version: None,
        upstream_model: None,
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
        .with_jitter(false)
}

pub fn breakers(threshold: u32) -> Arc<BreakerRegistry> {
    Arc::new(BreakerRegistry::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(threshold)
            .with_cooldown(Duration::from_secs(60)),
    ))
}

pub fn timeouts(chunk_secs: u64, request_secs: u64) -> TimeoutConfig {
    TimeoutConfig {
        chunk_timeout_secs: chunk_secs,
        request_timeout_secs: request_secs,
        ..Default::default()
    }
}

/// Gateway over real HTTP clients, for mockito-backed tests.
pub fn http_gateway(
    models: Vec<ModelDescriptor>,
    retry: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
) -> (Gateway, Arc<InMemoryMetricsSink>) {
    let metrics = Arc::new(InMemoryMetricsSink::new(64));
    let gateway = Gateway::builder()
        .resolver(Arc::new(ModelResolver::new().with_models(models)))
        .retry_policy(retry)
        .breakers(breakers)
        .metrics(metrics.clone())
        .build()
        .unwrap();
    (gateway, metrics)
}

/// Provider client answering from a queue of canned responses.
pub struct ScriptedClient {
    responses: Mutex<VecDeque<Result<ProviderResponse>>>,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedClient {
    pub fn new(responses: Vec<Result<ProviderResponse>>) -> Arc<Self> {
        Self::with_delay(responses, Duration::ZERO)
    }

    pub fn with_delay(responses: Vec<Result<ProviderResponse>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            delay,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for ScriptedClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    fn endpoint_key(&self) -> EndpointKey {
        EndpointKey::new(Provider::OpenAi, "https://scripted.test")
    }

    async fn send(&self, _request: &ProviderRequest) -> Result<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("script exhausted")
    }
}

pub struct ScriptedFactory(pub Arc<ScriptedClient>);

impl ProviderClientFactory for ScriptedFactory {
    fn create(&self, _model: Arc<ModelDescriptor>) -> Result<Arc<dyn ProviderClient>> {
        Ok(self.0.clone())
    }
}

pub fn scripted_gateway(
    client: Arc<ScriptedClient>,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
) -> (Gateway, Arc<InMemoryMetricsSink>) {
    let metrics = Arc::new(InMemoryMetricsSink::new(64));
    let gateway = Gateway::builder()
        .resolver(Arc::new(ModelResolver::new().with_models([model(
            "gpt-4o",
            Provider::OpenAi,
            "https://scripted.test",
            &[Capability::Chat, Capability::Completion],
        )])))
        .factory(Arc::new(ScriptedFactory(client)))
        .retry_policy(retry)
        .timeouts(timeouts)
        .metrics(metrics.clone())
        .build()
        .unwrap();
    (gateway, metrics)
}

pub fn chat_output(text: &str) -> ProviderResponse {
    ProviderResponse::Complete(ProviderOutput {
        id: Some("up-1".into()),
        choices: vec![OutputChoice {
            index: 0,
            payload: OutputPayload::Message(Message::assistant(text)),
            finish_reason: Some("stop".into()),
        }],
        usage: Some(Usage::new(3, 1)),
    })
}
