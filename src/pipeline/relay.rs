//! Pull-based stream relay.
//!
//! Reads one provider event, turns it into at most one [`StreamChunk`],
//! yields it, and only then reads the next. Each read races the
//! cancellation token, the per-chunk read timeout and the request deadline.

use futures::{stream, Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TimeoutPhase;
use crate::types::{OutputPayload, ProviderEvent, ProviderOutput, StreamChunk, Usage};
use crate::{BoxStream, Error};

/// One item handed to the caller side of a relayed stream.
#[derive(Debug)]
pub enum RelayFrame {
    Chunk(StreamChunk),
    /// Successful end; `usage` is the merged count observed from upstream.
    Done { usage: Option<Usage> },
    /// Terminal in-band error; nothing follows it.
    Error(Error),
}

/// How a relayed stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    Completed,
    Aborted,
    TimedOut(TimeoutPhase),
    /// Token cancelled or the consumer dropped the stream.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub delivered: u64,
    pub usage: Option<Usage>,
    pub end: RelayEnd,
}

pub type FinishHook = Box<dyn FnOnce(RelaySummary) + Send>;

pub type RelayStream = Pin<Box<dyn Stream<Item = RelayFrame> + Send>>;

/// Fires the hook exactly once, with `Cancelled` if the stream is dropped early.
struct FinishGuard {
    hook: Option<FinishHook>,
}

impl FinishGuard {
    fn fire(&mut self, summary: RelaySummary) {
        if let Some(hook) = self.hook.take() {
            hook(summary);
        }
    }
}

struct RelayState {
    events: BoxStream<'static, ProviderEvent>,
    cancel: CancellationToken,
    chunk_timeout: Option<Duration>,
    deadline: Option<Instant>,
    sequence: u64,
    usage: Option<Usage>,
    started: BTreeSet<u32>,
    finished: BTreeSet<u32>,
    ended: bool,
    guard: FinishGuard,
}

impl Drop for RelayState {
    fn drop(&mut self) {
        let summary = self.summary(RelayEnd::Cancelled);
        self.guard.fire(summary);
    }
}

enum Read {
    Item(Option<crate::Result<ProviderEvent>>),
    TimedOut(TimeoutPhase),
    Cancelled,
}

impl RelayState {
    fn summary(&self, end: RelayEnd) -> RelaySummary {
        RelaySummary {
            delivered: self.sequence,
            usage: self.usage,
            end,
        }
    }

    fn finish(&mut self, end: RelayEnd) {
        self.ended = true;
        let summary = self.summary(end);
        self.guard.fire(summary);
    }

    async fn read(&mut self) -> Read {
        let chunk_limit = self
            .chunk_timeout
            .and_then(|d| Instant::now().checked_add(d));
        let (limit, phase) = match (chunk_limit, self.deadline) {
            (Some(c), Some(d)) if d <= c => (Some(d), TimeoutPhase::Deadline),
            (Some(c), _) => (Some(c), TimeoutPhase::ChunkRead),
            (None, Some(d)) => (Some(d), TimeoutPhase::Deadline),
            (None, None) => (None, TimeoutPhase::ChunkRead),
        };
        let timer = async move {
            match limit {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Read::Cancelled,
            item = self.events.next() => Read::Item(item),
            _ = timer => Read::TimedOut(phase),
        }
    }

    fn merge_usage(&mut self, usage: Usage) {
        let merged = match self.usage {
            Some(prev) => Usage {
                prompt_tokens: prev.prompt_tokens.max(usage.prompt_tokens),
                completion_tokens: prev.completion_tokens.max(usage.completion_tokens),
                total_tokens: prev.total_tokens.max(usage.total_tokens),
            },
            None => usage,
        };
        // total is derived when the provider only reports the parts
        let parts = merged.prompt_tokens + merged.completion_tokens;
        self.usage = Some(Usage {
            total_tokens: merged.total_tokens.max(parts),
            ..merged
        });
    }

    fn chunk(
        &mut self,
        choice: u32,
        delta: String,
        call_delta: Option<Value>,
        finish_reason: Option<String>,
    ) -> RelayFrame {
        self.started.insert(choice);
        let chunk = StreamChunk {
            sequence: self.sequence,
            choice,
            delta,
            call_delta,
            finish_reason,
        };
        self.sequence += 1;
        RelayFrame::Chunk(chunk)
    }

    /// Next frame for the caller, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<RelayFrame> {
        if self.ended {
            return None;
        }
        loop {
            match self.read().await {
                Read::Cancelled => {
                    debug!(delivered = self.sequence, "relay cancelled");
                    self.finish(RelayEnd::Cancelled);
                    return None;
                }
                Read::TimedOut(phase) => {
                    warn!(delivered = self.sequence, phase = %phase, "relay timed out");
                    self.finish(RelayEnd::TimedOut(phase));
                    return Some(RelayFrame::Error(Error::Timeout { phase }));
                }
                Read::Item(Some(Ok(event))) => match event {
                    ProviderEvent::ContentDelta { index, text } => {
                        return Some(self.chunk(index, text, None, None))
                    }
                    ProviderEvent::CallDelta { index, delta } => {
                        return Some(self.chunk(index, String::new(), Some(delta), None))
                    }
                    ProviderEvent::Finish { index, reason } => {
                        self.finished.insert(index);
                        return Some(self.chunk(index, String::new(), None, Some(reason)));
                    }
                    ProviderEvent::Usage(usage) => self.merge_usage(usage),
                    ProviderEvent::Done => {
                        self.finish(RelayEnd::Completed);
                        return Some(RelayFrame::Done { usage: self.usage });
                    }
                },
                Read::Item(Some(Err(e))) => {
                    warn!(delivered = self.sequence, error = %e, "upstream stream failed");
                    let delivered = self.sequence;
                    self.finish(RelayEnd::Aborted);
                    let err = match e {
                        Error::StreamAborted { .. } | Error::Timeout { .. } => e,
                        other => Error::StreamAborted {
                            delivered,
                            message: other.to_string(),
                        },
                    };
                    return Some(RelayFrame::Error(err));
                }
                Read::Item(None) => {
                    // EOF without an explicit end marker is clean only when
                    // every choice that produced output also finished
                    let clean = !self.finished.is_empty() && self.started.is_subset(&self.finished);
                    if clean {
                        self.finish(RelayEnd::Completed);
                        return Some(RelayFrame::Done { usage: self.usage });
                    }
                    let delivered = self.sequence;
                    warn!(delivered, "upstream closed the stream before completion");
                    self.finish(RelayEnd::Aborted);
                    return Some(RelayFrame::Error(Error::StreamAborted {
                        delivered,
                        message: "upstream closed the stream before completion".into(),
                    }));
                }
            }
        }
    }
}

/// Relays a provider event stream to the caller.
pub struct StreamRelay {
    cancel: CancellationToken,
    chunk_timeout: Option<Duration>,
    deadline: Option<Instant>,
    on_finish: Option<FinishHook>,
}

impl StreamRelay {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            chunk_timeout: None,
            deadline: None,
            on_finish: None,
        }
    }

    /// Maximum wait for each upstream event.
    pub fn with_chunk_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    /// Absolute deadline for the whole request.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn on_finish(mut self, hook: impl FnOnce(RelaySummary) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(hook));
        self
    }

    pub fn relay(self, events: BoxStream<'static, ProviderEvent>) -> RelayStream {
        let state = RelayState {
            events,
            cancel: self.cancel,
            chunk_timeout: self.chunk_timeout,
            deadline: self.deadline,
            sequence: 0,
            usage: None,
            started: BTreeSet::new(),
            finished: BTreeSet::new(),
            ended: false,
            guard: FinishGuard {
                hook: self.on_finish,
            },
        };
        Box::pin(stream::unfold(state, |mut state| async move {
            let frame = state.next_frame().await?;
            Some((frame, state))
        }))
    }
}

/// Event sequence equivalent to a complete output, for providers that answer
/// a streaming request with a single JSON body.
pub fn events_from_output(output: ProviderOutput) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    for choice in output.choices {
        let index = choice.index;
        match choice.payload {
            OutputPayload::Text(text) => {
                if !text.is_empty() {
                    events.push(ProviderEvent::ContentDelta { index, text });
                }
            }
            OutputPayload::Message(message) => {
                let text = message.text();
                if !text.is_empty() {
                    events.push(ProviderEvent::ContentDelta { index, text });
                }
                let mut call = Map::new();
                if let Some(calls) = message.tool_calls.filter(|c| !c.is_empty()) {
                    let indexed: Vec<Value> = calls
                        .into_iter()
                        .enumerate()
                        .map(|(i, mut c)| {
                            if let Some(obj) = c.as_object_mut() {
                                obj.insert("index".into(), json!(i));
                            }
                            c
                        })
                        .collect();
                    call.insert("tool_calls".into(), Value::Array(indexed));
                }
                if let Some(fc) = message.function_call {
                    call.insert("function_call".into(), fc);
                }
                if !call.is_empty() {
                    events.push(ProviderEvent::CallDelta {
                        index,
                        delta: Value::Object(call),
                    });
                }
            }
        }
        events.push(ProviderEvent::Finish {
            index,
            reason: choice.finish_reason.unwrap_or_else(|| "stop".into()),
        });
    }
    if let Some(usage) = output.usage {
        events.push(ProviderEvent::Usage(usage));
    }
    events.push(ProviderEvent::Done);
    events
}
