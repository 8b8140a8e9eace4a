//! 流式处理模块：把上游 SSE 字节流解码为事件，并按顺序、按需拉取地转发给调用方。
//!
//! # Streaming pipeline
//!
//! ```text
//! upstream bytes → SseDecoder → provider parser → StreamRelay → SseRenderer → caller
//!                  (frames)     (ProviderEvent)   (RelayFrame)  (SSE message)
//! ```
//!
//! Every stage is a lazily polled `Stream`. Nothing is read from the upstream
//! until the caller asks for the next frame, so backpressure reaches the
//! provider connection directly and at most one chunk is in flight.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`decode`] | SSE frame decoder over raw bytes |
//! | [`relay`] | Sequenced relay with cancellation and timeouts |
//! | [`sse`] | OpenAI-compatible chunk rendering |

pub mod decode;
pub mod relay;
pub mod sse;

pub use decode::{SseDecoder, SseFrame};
pub use relay::{
    events_from_output, RelayEnd, RelayFrame, RelayStream, RelaySummary, StreamRelay,
};
pub use sse::{SseMessage, SseRenderer, DONE_DATA};
