//! 网关编排层：串联解析、授权、能力适配、弹性调用与流式转发
//!
//! # Gateway
//!
//! One call runs through:
//!
//! ```text
//! normalize → resolve → authorize → adapter::encode → ResiliencyWrapper(ProviderClient::send)
//!           → adapter::decode (complete) | StreamRelay (stream)
//! ```
//!
//! Nothing reaches a provider before the caller is authorized and the request
//! shape is known to be servable. Once the first streamed byte has been
//! relayed no retry happens; later failures end the stream in-band.

pub mod normalize;

pub use normalize::{normalize_chat, normalize_completion};

use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::adapter::{self, ConversionPath, ResponseMeta};
use crate::auth::AuthorizationGate;
use crate::config::{GatewayConfig, TimeoutConfig};
use crate::credentials::{AzureAdTokenClient, CredentialResolver};
use crate::drivers::{DefaultClientFactory, ProviderClientFactory, ProviderResponse};
use crate::error::TimeoutPhase;
use crate::pipeline::{
    events_from_output, RelayEnd, RelayStream, SseMessage, SseRenderer, StreamRelay,
};
use crate::registry::ModelResolver;
use crate::resilience::{BreakerRegistry, ResiliencyWrapper, RetryPolicy};
use crate::telemetry::{noop_sink, CallOutcome, CallRecord, MetricsSink};
use crate::transport::{HttpTransport, TransportConfig};
use crate::types::{
    CanonicalRequest, CanonicalResponse, Capability, EndpointKind, ModelDescriptor, Provider,
    ProviderEvent, Usage,
};
use crate::{BoxStream, Error, Result};

/// What the gateway answers with.
pub enum GatewayResponse {
    Complete(CanonicalResponse),
    Stream(GatewayStream),
}

impl fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayResponse::Complete(r) => f.debug_tuple("Complete").field(r).finish(),
            GatewayResponse::Stream(s) => f.debug_tuple("Stream").field(&s.id).finish(),
        }
    }
}

/// Relayed stream plus the identity fields every chunk carries.
pub struct GatewayStream {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub endpoint: EndpointKind,
    frames: RelayStream,
}

impl GatewayStream {
    pub fn into_frames(self) -> RelayStream {
        self.frames
    }

    /// OpenAI-compatible SSE messages, ending with `[DONE]` or an error frame.
    pub fn into_sse(self) -> impl Stream<Item = SseMessage> + Send {
        let mut renderer = SseRenderer::new(self.endpoint, self.id, self.created, self.model);
        self.frames.map(move |frame| renderer.render(&frame))
    }
}

/// Entry of `GET /v1/models`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
    pub display_name: String,
    pub capabilities: Vec<Capability>,
}

impl ModelCard {
    fn from_descriptor(model: &ModelDescriptor) -> Self {
        Self {
            id: model.name.clone(),
            object: "model",
            owned_by: model.provider.as_str(),
            display_name: model.display_name.clone(),
            capabilities: model.capabilities.iter().copied().collect(),
        }
    }
}

pub struct Gateway {
    resolver: Arc<ModelResolver>,
    gate: AuthorizationGate,
    factory: Arc<dyn ProviderClientFactory>,
    resilience: ResiliencyWrapper,
    timeouts: TimeoutConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("models", &self.resolver.len())
            .field("gate", &self.gate)
            .field("resilience", &self.resilience)
            .finish()
    }
}

/// Per-call bookkeeping for metrics.
struct CallContext {
    request_id: String,
    model: String,
    provider: Option<Provider>,
    endpoint: EndpointKind,
    stream: bool,
    started: Instant,
}

impl CallContext {
    fn record(
        &self,
        outcome: CallOutcome,
        http_status: u16,
        chunks: u64,
        usage: Option<Usage>,
    ) -> CallRecord {
        CallRecord {
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            provider: self.provider,
            endpoint: self.endpoint,
            stream: self.stream,
            outcome,
            http_status,
            duration: self.started.elapsed(),
            chunks,
            usage,
        }
    }

    fn failure(&self, err: &Error) -> CallRecord {
        let outcome = match err {
            Error::Validation { .. }
            | Error::NotFound { .. }
            | Error::Authorization { .. }
            | Error::UnsupportedCapability { .. } => CallOutcome::Rejected,
            Error::CircuitOpen { .. } => CallOutcome::CircuitOpen,
            Error::Timeout { .. } => CallOutcome::Timeout,
            _ => CallOutcome::Failed,
        };
        self.record(outcome, err.http_status(), 0, None)
    }
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Wire a gateway from configuration around an existing catalog.
    pub fn from_config(config: &GatewayConfig, resolver: Arc<ModelResolver>) -> Result<Self> {
        let transport = HttpTransport::new(&config.transport)?;
        let mut credentials = CredentialResolver::new();
        if let Some(azure) = &config.azure_ad {
            credentials = credentials.with_azure(Arc::new(AzureAdTokenClient::new(
                azure.clone(),
                transport.clone(),
            )?));
        }
        let mut gate = AuthorizationGate::new();
        if let Some(admin) = &config.auth.admin_group {
            gate = gate.with_admin_group(admin.clone());
        }

        Gateway::builder()
            .resolver(resolver)
            .gate(gate)
            .factory(Arc::new(DefaultClientFactory::new(transport, credentials)))
            .retry_policy(config.retry_policy())
            .breakers(Arc::new(BreakerRegistry::new(config.breaker_config())))
            .timeouts(config.timeouts.clone())
            .build()
    }

    pub fn resolver(&self) -> &Arc<ModelResolver> {
        &self.resolver
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.resilience.breakers()
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Models the caller may use, in name order.
    pub fn list_models(&self, groups: &BTreeSet<String>) -> Vec<ModelCard> {
        self.resolver
            .list()
            .iter()
            .filter(|m| self.gate.authorize(groups, m).is_allowed())
            .map(|m| ModelCard::from_descriptor(m))
            .collect()
    }

    /// Serve one canonical request for a caller in `groups`.
    ///
    /// `cancel` aborts a relayed stream at its next suspension point. Before
    /// the response starts, dropping the returned future cancels the call.
    pub async fn handle(
        &self,
        request: CanonicalRequest,
        groups: &BTreeSet<String>,
        cancel: CancellationToken,
    ) -> Result<GatewayResponse> {
        let mut ctx = CallContext {
            request_id: uuid::Uuid::new_v4().simple().to_string(),
            model: request.model.clone(),
            provider: None,
            endpoint: request.endpoint(),
            stream: request.stream,
            started: Instant::now(),
        };
        let span = info_span!(
            "gateway_call",
            request_id = %ctx.request_id,
            model = %ctx.model,
            endpoint = %ctx.endpoint,
            stream = ctx.stream,
        );

        let result = self
            .dispatch(&mut ctx, request, groups, cancel)
            .instrument(span)
            .await;
        if let Err(err) = &result {
            info!(request_id = %ctx.request_id, model = %ctx.model, error = %err, "call failed");
            self.metrics.record(ctx.failure(err));
        }
        result
    }

    async fn dispatch(
        &self,
        ctx: &mut CallContext,
        request: CanonicalRequest,
        groups: &BTreeSet<String>,
        cancel: CancellationToken,
    ) -> Result<GatewayResponse> {
        let model = self.resolver.resolve(&request.model)?;
        ctx.provider = Some(model.provider);
        let allow = self.gate.authorize(groups, &model).into_result(&model.name)?;
        debug!(reason = allow.code(), "caller authorized");

        let (path, wire) = adapter::encode(&request, &model)?;
        if path.is_conversion() {
            debug!(path = ?path, "converting request shape");
        }
        let client = self.factory.create(model.clone())?;
        let timeouts = self.timeouts.for_provider(model.provider);
        let deadline = timeouts
            .request_timeout()
            .and_then(|d| Instant::now().checked_add(d));

        let endpoint_key = client.endpoint_key();
        let call = self.resilience.execute(&endpoint_key, |_attempt| {
            let client = client.clone();
            let wire = &wire;
            async move { client.send(wire).await }
        });
        let response = match deadline {
            Some(at) => tokio::time::timeout_at(at, call).await.map_err(|_| Error::Timeout {
                phase: TimeoutPhase::Deadline,
            })??,
            None => call.await?,
        };

        let requested = request.endpoint();
        let meta = response_meta(requested, &request.model);

        if !request.stream {
            let output = match response {
                ProviderResponse::Complete(output) => output,
                ProviderResponse::Stream(_) => {
                    return Err(Error::UpstreamFatal {
                        status: None,
                        attempts: 1,
                        message: "upstream streamed a non-streaming request".into(),
                    })
                }
            };
            let decoded = adapter::decode(requested, path, output, meta)?;
            info!(
                provider = %model.provider,
                duration_ms = ctx.started.elapsed().as_millis() as u64,
                "call completed"
            );
            self.metrics
                .record(ctx.record(CallOutcome::Success, 200, 0, decoded.usage()));
            return Ok(GatewayResponse::Complete(decoded));
        }

        let events: BoxStream<'static, ProviderEvent> = match response {
            ProviderResponse::Stream(events) => events,
            ProviderResponse::Complete(output) => {
                debug!("upstream answered a stream request with a single body");
                Box::pin(stream::iter(
                    events_from_output(output).into_iter().map(Ok),
                ))
            }
        };
        let events = converted(path, events);

        let metrics = self.metrics.clone();
        let finished = CallContext {
            request_id: ctx.request_id.clone(),
            model: ctx.model.clone(),
            provider: ctx.provider,
            endpoint: ctx.endpoint,
            stream: true,
            started: ctx.started,
        };
        let frames = StreamRelay::new(cancel)
            .with_chunk_timeout(timeouts.chunk_timeout())
            .with_deadline(deadline)
            .on_finish(move |summary| {
                let (outcome, status) = match summary.end {
                    RelayEnd::Completed => (CallOutcome::Success, 200),
                    RelayEnd::Aborted => (CallOutcome::Aborted, 502),
                    RelayEnd::TimedOut(_) => (CallOutcome::Timeout, 504),
                    // 499: client closed request
                    RelayEnd::Cancelled => (CallOutcome::Aborted, 499),
                };
                info!(
                    request_id = %finished.request_id,
                    delivered = summary.delivered,
                    outcome = outcome.as_str(),
                    "stream finished"
                );
                metrics.record(finished.record(outcome, status, summary.delivered, summary.usage));
            })
            .relay(events);

        Ok(GatewayResponse::Stream(GatewayStream {
            id: meta.fallback_id,
            created: meta.created,
            model: meta.model,
            endpoint: requested,
            frames,
        }))
    }
}

fn converted(
    path: ConversionPath,
    events: BoxStream<'static, ProviderEvent>,
) -> BoxStream<'static, ProviderEvent> {
    if !path.is_conversion() {
        return events;
    }
    Box::pin(events.map(move |e| e.and_then(|ev| adapter::decode_event(path, ev))))
}

fn response_meta(endpoint: EndpointKind, model: &str) -> ResponseMeta {
    let prefix = match endpoint {
        EndpointKind::Chat => "chatcmpl",
        EndpointKind::Completion => "cmpl",
    };
    ResponseMeta {
        fallback_id: format!("{}-{}", prefix, uuid::Uuid::new_v4().simple()),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
    }
}

/// Builder for [`Gateway`].
#[derive(Default)]
pub struct GatewayBuilder {
    resolver: Option<Arc<ModelResolver>>,
    gate: Option<AuthorizationGate>,
    factory: Option<Arc<dyn ProviderClientFactory>>,
    retry_policy: Option<RetryPolicy>,
    breakers: Option<Arc<BreakerRegistry>>,
    timeouts: Option<TimeoutConfig>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl GatewayBuilder {
    pub fn resolver(mut self, resolver: Arc<ModelResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn gate(mut self, gate: AuthorizationGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn ProviderClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Share a breaker registry, e.g. to inspect or reset it from tests.
    pub fn breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let factory: Arc<dyn ProviderClientFactory> = match self.factory {
            Some(f) => f,
            None => Arc::new(DefaultClientFactory::new(
                HttpTransport::new(&TransportConfig::default())?,
                CredentialResolver::new(),
            )),
        };
        Ok(Gateway {
            resolver: self.resolver.unwrap_or_default(),
            gate: self.gate.unwrap_or_default(),
            factory,
            resilience: ResiliencyWrapper::new(
                self.retry_policy.unwrap_or_default(),
                self.breakers.unwrap_or_default(),
            ),
            timeouts: self.timeouts.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_else(noop_sink),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ProviderClient, ProviderRequest};
    use crate::telemetry::InMemoryMetricsSink;
    use crate::types::{
        CredentialRef, EndpointKey, Message, ModelStatus, OutputChoice, OutputPayload,
        ProviderOutput,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Answers from a fixed script and records what it was sent.
    struct Scripted {
        calls: AtomicU32,
        seen: Mutex<Vec<ProviderRequest>>,
        text: String,
    }

    #[async_trait]
    impl ProviderClient for Scripted {
        fn provider(&self) -> Provider {
            Provider::OpenAi
        }

        fn endpoint_key(&self) -> EndpointKey {
            EndpointKey::new(Provider::OpenAi, "https://scripted")
        }

        async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.clone());
            let payload = match request.endpoint() {
                EndpointKind::Chat => OutputPayload::Message(Message::assistant(self.text.clone())),
                EndpointKind::Completion => OutputPayload::Text(self.text.clone()),
            };
            Ok(ProviderResponse::Complete(ProviderOutput {
                id: None,
                choices: vec![OutputChoice {
                    index: 0,
                    payload,
                    finish_reason: Some("stop".into()),
                }],
                usage: Some(Usage::new(5, 2)),
            }))
        }
    }

    struct ScriptedFactory(Arc<Scripted>);

    impl ProviderClientFactory for ScriptedFactory {
        fn create(&self, _model: Arc<ModelDescriptor>) -> Result<Arc<dyn ProviderClient>> {
            Ok(self.0.clone())
        }
    }

    fn model(name: &str, caps: &[Capability], status: ModelStatus) -> ModelDescriptor {
        ModelDescriptor {
            name: name.into(),
            display_name: name.into(),
            provider: Provider::OpenAi,
            base_url: url::Url::parse("https://scripted").unwrap(),
            capabilities: caps.iter().copied().collect(),
            credential: CredentialRef::None,
            status,
            allowed_groups: ["staff".to_string()].into_iter().collect(),
            deployment: None,
            api_version: None,
            upstream_model: None,
        }
    }

    fn setup() -> (Gateway, Arc<Scripted>, Arc<InMemoryMetricsSink>) {
        let scripted = Arc::new(Scripted {
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
            text: " 4".into(),
        });
        let metrics = Arc::new(InMemoryMetricsSink::new(16));
        let resolver = Arc::new(ModelResolver::new().with_models([
            model("chat", &[Capability::Chat], ModelStatus::Active),
            model("legacy", &[Capability::Completion], ModelStatus::Active),
            model("retired", &[Capability::Chat], ModelStatus::Disabled),
        ]));
        let gateway = Gateway::builder()
            .resolver(resolver)
            .factory(Arc::new(ScriptedFactory(scripted.clone())))
            .metrics(metrics.clone())
            .build()
            .unwrap();
        (gateway, scripted, metrics)
    }

    fn staff() -> BTreeSet<String> {
        ["staff".to_string()].into_iter().collect()
    }

    #[tokio::test]
    async fn test_chat_through_completion_model() {
        let (gateway, scripted, metrics) = setup();
        let request = CanonicalRequest::chat(
            "legacy",
            vec![Message::system("Be exact."), Message::user("2+2?")],
        );
        let resp = gateway
            .handle(request, &staff(), CancellationToken::new())
            .await
            .unwrap();
        let GatewayResponse::Complete(CanonicalResponse::Chat(chat)) = resp else {
            panic!("expected chat completion");
        };
        assert_eq!(chat.model, "legacy");
        assert_eq!(chat.choices.len(), 1);
        assert_eq!(chat.choices[0].message.text(), " 4");
        assert!(chat.id.starts_with("chatcmpl-"));

        let seen = scripted.seen.lock().unwrap();
        assert_eq!(seen[0].endpoint(), EndpointKind::Completion);
        assert_eq!(metrics.records()[0].outcome, CallOutcome::Success);
    }

    #[tokio::test]
    async fn test_denials_make_no_upstream_call() {
        let (gateway, scripted, metrics) = setup();
        let err = gateway
            .handle(
                CanonicalRequest::chat("retired", vec![Message::user("x")]),
                &staff(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.wire_code(), "model_disabled");

        let outsider: BTreeSet<String> = ["guests".to_string()].into_iter().collect();
        let err = gateway
            .handle(
                CanonicalRequest::chat("chat", vec![Message::user("x")]),
                &outsider,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 403);

        let err = gateway
            .handle(
                CanonicalRequest::chat("nope", vec![Message::user("x")]),
                &staff(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);

        assert_eq!(scripted.calls.load(Ordering::SeqCst), 0);
        assert!(metrics
            .records()
            .iter()
            .all(|r| r.outcome == CallOutcome::Rejected));
    }

    #[tokio::test]
    async fn test_stream_synthesized_from_single_body() {
        let (gateway, _, metrics) = setup();
        let resp = gateway
            .handle(
                CanonicalRequest::chat("chat", vec![Message::user("x")]).streaming(true),
                &staff(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let GatewayResponse::Stream(stream) = resp else {
            panic!("expected stream");
        };
        let messages: Vec<SseMessage> = stream.into_sse().collect().await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].data, "[DONE]");

        let record = &metrics.records()[0];
        assert_eq!(record.outcome, CallOutcome::Success);
        assert_eq!(record.chunks, 2);
        assert_eq!(record.usage, Some(Usage::new(5, 2)));
    }

    #[test]
    fn test_list_models_filters_by_gate() {
        let (gateway, _, _) = setup();
        let ids: Vec<String> = gateway.list_models(&staff()).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["chat".to_string(), "legacy".to_string()]);
        assert!(gateway.list_models(&BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_list_models_admin_sees_all_active() {
        let (gateway, _, _) = setup();
        let resolver = gateway.resolver().clone();
        let admin = Gateway::builder()
            .resolver(resolver)
            .gate(AuthorizationGate::new().with_admin_group("admins"))
            .build()
            .unwrap();
        let groups: BTreeSet<String> = ["admins".to_string()].into_iter().collect();
        let ids: Vec<String> = admin.list_models(&groups).into_iter().map(|m| m.id).collect();
        // disabled models stay hidden from admins too
        assert_eq!(ids, vec!["chat".to_string(), "legacy".to_string()]);
    }
}
