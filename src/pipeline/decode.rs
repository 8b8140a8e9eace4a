//! Streaming decoder (Bytes -> SSE frames)
//!
//! Decodes the framing only. What a frame means is up to the provider driver.

use crate::BoxStream;
use bytes::Bytes;
use futures::{stream, StreamExt};

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field, if the upstream named the event.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Parse a single frame; `None` for comment-only or data-less frames.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();
        for line in raw.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }
        if data.is_empty() {
            return None;
        }
        Some(Self {
            event,
            data: data.join("\n"),
        })
    }
}

/// Incremental SSE decoder.
///
/// - buffers raw bytes so multi-byte characters split across reads survive
/// - drops `\r` so CRLF framing behaves like LF
/// - emits one frame per blank-line delimited block, including `[DONE]`
pub struct SseDecoder;

impl SseDecoder {
    pub fn decode_stream(input: BoxStream<'static, Bytes>) -> BoxStream<'static, SseFrame> {
        let stream = stream::unfold(
            (input, Vec::<u8>::new(), false),
            |(mut input, mut buf, finished)| async move {
                if finished {
                    return None;
                }
                loop {
                    if let Some(idx) = find_delimiter(&buf) {
                        let frame: Vec<u8> = buf.drain(..idx + 2).collect();
                        let text = String::from_utf8_lossy(&frame[..idx]);
                        match SseFrame::parse(&text) {
                            Some(frame) => return Some((Ok(frame), (input, buf, false))),
                            None => continue,
                        }
                    }

                    match input.next().await {
                        Some(Ok(bytes)) => {
                            buf.extend(bytes.iter().copied().filter(|b| *b != b'\r'));
                        }
                        Some(Err(e)) => return Some((Err(e), (input, buf, true))),
                        None => {
                            // EOF: a trailing frame without the blank line still counts
                            let text = String::from_utf8_lossy(&buf).into_owned();
                            return SseFrame::parse(&text)
                                .map(|frame| (Ok(frame), (input, Vec::new(), true)));
                        }
                    }
                }
            },
        );
        Box::pin(stream)
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn chunks(parts: &[&'static [u8]]) -> BoxStream<'static, Bytes> {
        let items: Vec<crate::Result<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let input = chunks(&[
            b"data: {\"a\":",
            b"1}\n\nevent: ping\r\ndata: x\r\n\r\n: keep-alive\n\n",
            b"data: [DONE]\n\n",
        ]);
        let frames: Vec<SseFrame> = SseDecoder::decode_stream(input)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].event.as_deref(), Some("ping"));
        assert_eq!(frames[1].data, "x");
        assert!(frames[2].is_done());
    }

    #[tokio::test]
    async fn test_multibyte_boundary() {
        let input = chunks(&[b"data: \xe4\xbd", b"\xa0\xe5\xa5\xbd\n\n"]);
        let frames: Vec<SseFrame> = SseDecoder::decode_stream(input)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(frames[0].data, "你好");
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let items: Vec<crate::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\n")),
            Err(Error::StreamAborted {
                delivered: 0,
                message: "reset".into(),
            }),
            Ok(Bytes::from_static(b"data: 2\n\n")),
        ];
        let out: Vec<_> = SseDecoder::decode_stream(Box::pin(stream::iter(items)))
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert!(out[1].is_err());
    }

    #[test]
    fn test_multiline_data() {
        let frame = SseFrame::parse("data: a\ndata: b").unwrap();
        assert_eq!(frame.data, "a\nb");
        assert!(SseFrame::parse(": comment").is_none());
    }
}
