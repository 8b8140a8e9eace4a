//! # ai-gateway-rust
//!
//! 这是一个 OpenAI 兼容的模型网关：按模型目录路由、授权、适配能力，并以重试与熔断保护上游调用。
//!
//! OpenAI-compatible gateway that routes chat and completion calls to
//! heterogeneous LLM providers behind one API.
//!
//! ## Overview
//!
//! Callers speak the OpenAI wire format. The gateway resolves the requested
//! model in a hot-swappable catalog, checks the caller's groups against the
//! model's allowed groups, and adapts the request to a shape the model can
//! serve (a chat request on a completion-only model is flattened to a prompt
//! and back). The provider call runs under a retry policy and a per-endpoint
//! circuit breaker. Streaming responses are relayed chunk by chunk with
//! chunk-read and deadline timeouts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_gateway_rust::registry::ModelResolver;
//! use ai_gateway_rust::{Gateway, GatewayConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ai_gateway_rust::Result<()> {
//!     let config = GatewayConfig::load("gateway.yaml")?;
//!     let resolver = Arc::new(ModelResolver::new().with_strict(config.catalog.strict));
//!     let gateway = Arc::new(Gateway::from_config(&config, resolver)?);
//!     // hand `gateway` to `server::router`
//!     # let _ = gateway;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`types`] | Canonical requests, responses, messages and model descriptors |
//! | [`registry`] | Model catalog and resolver |
//! | [`auth`] | Caller identity and the group-based authorization gate |
//! | [`adapter`] | Chat/completion capability conversion |
//! | [`drivers`] | OpenAI, Azure OpenAI and Anthropic provider clients |
//! | [`resilience`] | Retry policy and circuit breakers |
//! | [`pipeline`] | SSE decoding, stream relay and SSE rendering |
//! | [`gateway`] | Request normalization and call orchestration |
//! | [`server`] | axum routes and error bodies |
//! | [`config`] | YAML configuration with environment overrides |
//! | [`telemetry`] | Per-call metrics records |

pub mod adapter;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod drivers;
pub mod error_code;
pub mod gateway;
pub mod pipeline;
pub mod registry;
pub mod resilience;
pub mod server;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayBuilder, GatewayResponse, GatewayStream};
pub use types::{
    CanonicalRequest, CanonicalResponse, EndpointKind, Message, MessageRole, ModelDescriptor,
    Provider,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
