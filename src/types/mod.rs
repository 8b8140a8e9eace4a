//! 类型系统模块：网关内部的规范化请求、响应、流式分片与模型描述。
//!
//! # Types Module
//!
//! Provider-agnostic types shared by every stage of the gateway.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CanonicalRequest`] | Inbound chat or completion call after normalization |
//! | [`Message`] | Chat message with role and content |
//! | [`ModelDescriptor`] | Read-only description of a routable model |
//! | [`StreamChunk`] | One sequenced delta relayed to the caller |
//! | [`CanonicalResponse`] | OpenAI-shaped non-streaming response |
//!
//! ## Submodules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`events`] | Provider stream events and relayed chunks |
//! | [`message`] | Chat messages and content parts |
//! | [`model`] | Providers, capabilities and model descriptors |
//! | [`request`] | Canonical request and sampling parameters |
//! | [`response`] | Canonical responses and token usage |
//! | [`tool`] | Tool/function definitions |
//!
//! ## Example
//!
//! ```rust
//! use ai_gateway_rust::types::{CanonicalRequest, Message};
//!
//! let request = CanonicalRequest::chat(
//!     "gpt-4o",
//!     vec![Message::system("Be brief."), Message::user("Hello")],
//! );
//! assert!(!request.stream);
//! ```

pub mod events;
pub mod message;
pub mod model;
pub mod request;
pub mod response;
pub mod tool;

pub use events::{ProviderEvent, StreamChunk};
pub use message::{ContentPart, Message, MessageContent, MessageRole};
pub use model::{Capability, CredentialRef, EndpointKey, ModelDescriptor, ModelStatus, Provider};
pub use request::{CanonicalRequest, EndpointKind, RequestInput, SamplingParams};
pub use response::{
    CanonicalResponse, ChatChoice, ChatCompletion, OutputChoice, OutputPayload, ProviderOutput,
    TextChoice, TextCompletion, Usage,
};
pub use tool::{FunctionDefinition, ToolDefinition};
