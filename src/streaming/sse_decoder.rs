//! SSE 帧解码器
//!
//! 将 `/api/llm/stream` 返回的字节流增量解码为 [`StreamEvent`] 序列。
//!
//! # 线协议
//!
//! - 帧之间以空行（`"\n\n"`）分隔，chunk 可能在帧中间任意位置切断
//! - 帧体为 `data: <json>` 或 `data: [DONE]`
//! - `{"content": "..."}` 携带截至目前的**累积**内容
//! - `{"error": "..."}` 表示上游失败，解码随之终止
//!
//! 帧 JSON 无法解析时不会静默丢弃，而是返回 [`StreamError::ParseError`]。

use crate::config::StreamSettings;
use crate::streaming::error::StreamError;
use crate::streaming::metrics::StreamMetrics;
use crate::streaming::traits::StreamResponse;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 流结束哨兵
pub const DONE_SENTINEL: &str = "[DONE]";

/// 帧分隔符
const FRAME_SEPARATOR: &str = "\n\n";

/// 解码后的流事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// 内容增量（携带截至目前的累积内容）
    Delta {
        /// 累积内容
        content: String,
    },

    /// 流结束
    Done {
        /// 是否收到过 `[DONE]` 哨兵
        sentinel: bool,
    },

    /// 上游错误帧
    Error {
        /// 错误消息
        message: String,
    },
}

impl StreamEvent {
    /// 是否为终止事件
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Delta { .. })
    }
}

/// 解码器状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DecoderState {
    /// 等待数据
    #[default]
    Idle,
    /// 正在解码
    Decoding,
    /// 已正常结束
    Completed,
    /// 因错误终止
    Failed(String),
}

impl DecoderState {
    /// 是否已进入终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecoderState::Completed | DecoderState::Failed(_))
    }
}

/// SSE 帧解码器
///
/// 每轮生成使用一个新的解码器（或调用 [`reset`](Self::reset) 复用）。
///
/// ```ignore
/// let mut decoder = SseFrameDecoder::new();
/// for chunk in chunks {
///     for event in decoder.process(&chunk)? {
///         // ...
///     }
/// }
/// let tail = decoder.finish()?;
/// ```
#[derive(Debug)]
pub struct SseFrameDecoder {
    /// 尚未凑成完整 UTF-8 字符的尾部字节
    pending_bytes: Vec<u8>,
    /// 尚未遇到分隔符的帧文本
    buffer: String,
    /// 当前状态
    state: DecoderState,
    /// 是否收到过 `[DONE]`
    saw_done_sentinel: bool,
    /// 已解码的帧数
    frame_count: usize,
    /// 未完成帧的最大长度
    max_buffer_size: usize,
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseFrameDecoder {
    /// 默认最大缓冲区大小 (1MB)
    pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;

    /// 创建新的解码器
    pub fn new() -> Self {
        Self::with_max_buffer_size(Self::DEFAULT_MAX_BUFFER_SIZE)
    }

    /// 创建带自定义缓冲区大小的解码器
    pub fn with_max_buffer_size(max_size: usize) -> Self {
        Self {
            pending_bytes: Vec::new(),
            buffer: String::new(),
            state: DecoderState::Idle,
            saw_done_sentinel: false,
            frame_count: 0,
            max_buffer_size: max_size,
        }
    }

    /// 获取当前状态
    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// 是否收到过 `[DONE]` 哨兵
    pub fn saw_done_sentinel(&self) -> bool {
        self.saw_done_sentinel
    }

    /// 已解码的帧数
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// 当前缓冲的未完成帧长度
    pub fn buffer_size(&self) -> usize {
        self.buffer.len() + self.pending_bytes.len()
    }

    /// 重置解码器
    pub fn reset(&mut self) {
        self.pending_bytes.clear();
        self.buffer.clear();
        self.state = DecoderState::Idle;
        self.saw_done_sentinel = false;
        self.frame_count = 0;
    }

    /// 处理接收到的字节
    ///
    /// 返回本次 chunk 中所有完整帧解码出的事件。遇到 error 帧时返回的列表
    /// 以 [`StreamEvent::Error`] 结尾，之后的输入全部忽略。
    pub fn process(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>, StreamError> {
        if self.state.is_terminal() || bytes.is_empty() {
            return Ok(Vec::new());
        }
        self.state = DecoderState::Decoding;

        self.pending_bytes.extend_from_slice(bytes);
        let text = take_utf8_prefix(&mut self.pending_bytes);
        self.buffer.push_str(&text);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }

        let events = self.drain_frames()?;

        if self.buffer.len() > self.max_buffer_size {
            self.fail("缓冲区溢出");
            return Err(StreamError::BufferOverflow);
        }

        Ok(events)
    }

    /// 完成解码
    ///
    /// 将缓冲区中剩余的文本当作最后一帧处理，并追加 [`StreamEvent::Done`]。
    /// 连接在帧中间断开时，这个没有分隔符的残帧往往无法解析，此时丢弃它，
    /// 已累积的内容照常交给调用方。解码器已因错误终止时返回空列表。
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        if self.state.is_terminal() {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();

        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.pending_bytes.clear();
            self.buffer.push_str(&tail);
        }

        let rest = std::mem::take(&mut self.buffer);
        if !rest.trim().is_empty() {
            match self.decode_frame(&rest) {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        return Ok(events);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        error = %e,
                        frame = %preview(rest.trim()),
                        "丢弃连接断开时未完成的残帧"
                    );
                }
            }
        }

        self.state = DecoderState::Completed;
        events.push(StreamEvent::Done {
            sentinel: self.saw_done_sentinel,
        });
        Ok(events)
    }

    /// 取出缓冲区中所有完整帧并解码
    fn drain_frames(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        let mut events = Vec::new();
        let mut consumed = 0;

        while let Some(rel) = self.buffer[consumed..].find(FRAME_SEPARATOR) {
            let end = consumed + rel;
            let frame = self.buffer[consumed..end].to_string();
            consumed = end + FRAME_SEPARATOR.len();

            match self.handle_frame(&frame) {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    events.push(event);
                    if terminal {
                        self.buffer.clear();
                        return Ok(events);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }

        Ok(events)
    }

    /// 解码单个完整帧，JSON 无法解析时解码器进入失败状态
    fn handle_frame(&mut self, frame: &str) -> Result<Option<StreamEvent>, StreamError> {
        self.decode_frame(frame).map_err(|e| {
            self.fail(&e.to_string());
            e
        })
    }

    fn decode_frame(&mut self, frame: &str) -> Result<Option<StreamEvent>, StreamError> {
        self.frame_count += 1;

        let data_lines: Vec<&str> = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();

        // 注释帧、纯 event 帧
        if data_lines.is_empty() {
            return Ok(None);
        }

        let payload = data_lines.join("\n");
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            debug!(frames = self.frame_count, "收到 [DONE] 哨兵");
            self.saw_done_sentinel = true;
            return Ok(None);
        }

        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                return Err(StreamError::parse(format!(
                    "{} (frame: {})",
                    e,
                    preview(payload)
                )));
            }
        };

        if let Some(error) = value.get("error").filter(|v| !v.is_null()) {
            let message = error_message(error);
            self.fail(&message);
            return Ok(Some(StreamEvent::Error { message }));
        }

        match value.get("content").and_then(|v| v.as_str()) {
            Some(content) => Ok(Some(StreamEvent::Delta {
                content: content.to_string(),
            })),
            None => {
                debug!(frame = %preview(payload), "忽略未知结构的帧");
                Ok(None)
            }
        }
    }

    fn fail(&mut self, message: &str) {
        self.state = DecoderState::Failed(message.to_string());
        self.buffer.clear();
        self.pending_bytes.clear();
    }
}

// ============================================================================
// 惰性事件流
// ============================================================================

/// 解码后的事件流
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

/// 读取下一个字节 chunk，超过 `chunk_timeout` 未到达时返回 [`StreamError::Timeout`]
pub async fn next_chunk(
    source: &mut StreamResponse,
    chunk_timeout: Duration,
) -> Option<Result<Bytes, StreamError>> {
    match tokio::time::timeout(chunk_timeout, source.next()).await {
        Ok(item) => item,
        Err(_) => Some(Err(StreamError::Timeout)),
    }
}

/// 将字节流包装为惰性的 [`StreamEvent`] 流
///
/// 流在以下情况结束：产出 [`StreamEvent::Done`]、产出 [`StreamEvent::Error`]、
/// 或产出一个 `Err`。
pub fn decode_stream(source: StreamResponse, settings: &StreamSettings) -> EventStream {
    decode_stream_with_metrics(source, settings, Arc::new(Mutex::new(StreamMetrics::new())))
}

/// 同 [`decode_stream`]，并把 chunk、帧与 delta 计数写入 `metrics`
///
/// 锁只在单条语句内持有，不会跨越 `yield`。
pub fn decode_stream_with_metrics(
    mut source: StreamResponse,
    settings: &StreamSettings,
    metrics: Arc<Mutex<StreamMetrics>>,
) -> EventStream {
    let chunk_timeout = settings.chunk_timeout();
    let mut decoder = SseFrameDecoder::with_max_buffer_size(settings.max_buffer_size);

    let stream = async_stream::stream! {
        loop {
            let chunk = next_chunk(&mut source, chunk_timeout).await;
            let finished = chunk.is_none();
            let frames_before = decoder.frame_count();
            let decoded = match chunk {
                Some(Ok(bytes)) => {
                    metrics.lock().record_chunk(bytes.len());
                    decoder.process(&bytes)
                }
                Some(Err(e)) => Err(e),
                None => decoder.finish(),
            };
            metrics
                .lock()
                .record_frames(decoder.frame_count().saturating_sub(frames_before));

            let events = match decoded {
                Ok(events) => events,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for event in events {
                if let StreamEvent::Delta { content } = &event {
                    metrics.lock().record_delta(content.len());
                }
                let terminal = event.is_terminal();
                yield Ok(event);
                if terminal {
                    return;
                }
            }
            if finished {
                return;
            }
        }
    };

    Box::pin(stream)
}

// ============================================================================
// 辅助函数
// ============================================================================

/// 取出 `bytes` 中可以解码的 UTF-8 前缀，末尾不完整的多字节序列留在原处
///
/// 中间出现的非法字节替换为 U+FFFD。
fn take_utf8_prefix(bytes: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut start = 0;

    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(valid) => {
                out.push_str(valid);
                start = bytes.len();
                break;
            }
            Err(e) => {
                let valid_end = start + e.valid_up_to();
                // valid_up_to 之前的字节已确认是合法 UTF-8
                out.push_str(&String::from_utf8_lossy(&bytes[start..valid_end]));
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }

    bytes.drain(..start);
    out
}

/// 提取 error 字段中的消息
fn error_message(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| other.to_string()),
    }
}

/// 截取帧内容用于日志与错误消息
fn preview(payload: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 120;
    if payload.chars().count() <= MAX_PREVIEW_CHARS {
        payload.to_string()
    } else {
        let head: String = payload.chars().take(MAX_PREVIEW_CHARS).collect();
        format!("{}...", head)
    }
}

/// 从事件列表中取最后一次 delta 的累积内容
pub fn last_content(events: &[StreamEvent]) -> Option<&str> {
    events.iter().rev().find_map(|e| match e {
        StreamEvent::Delta { content } => Some(content.as_str()),
        _ => None,
    })
}

// ============================================================================
// 测试模块
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn frame(json: &str) -> String {
        format!("data: {}\n\n", json)
    }

    #[test]
    fn test_decoder_new() {
        let decoder = SseFrameDecoder::new();
        assert_eq!(decoder.state(), &DecoderState::Idle);
        assert_eq!(decoder.buffer_size(), 0);
        assert!(!decoder.saw_done_sentinel());
    }

    #[test]
    fn test_decode_single_delta() {
        let mut decoder = SseFrameDecoder::new();
        let events = decoder
            .process(frame(r#"{"content":"<mxfile>"}"#).as_bytes())
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Delta {
                content: "<mxfile>".to_string()
            }]
        );
        assert_eq!(decoder.state(), &DecoderState::Decoding);
    }

    #[test]
    fn test_decode_cumulative_frames() {
        let mut decoder = SseFrameDecoder::new();
        let data = format!(
            "{}{}data: [DONE]\n\n",
            frame(r#"{"content":"<a"}"#),
            frame(r#"{"content":"<ab"}"#)
        );
        let events = decoder.process(data.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(last_content(&events), Some("<ab"));
        assert!(decoder.saw_done_sentinel());

        let tail = decoder.finish().unwrap();
        assert_eq!(tail, vec![StreamEvent::Done { sentinel: true }]);
        assert_eq!(decoder.state(), &DecoderState::Completed);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut decoder = SseFrameDecoder::new();
        assert!(decoder.process(b"data: {\"cont").unwrap().is_empty());
        assert!(decoder.process(b"ent\":\"hel").unwrap().is_empty());
        assert!(decoder.process(b"lo\"}\n").unwrap().is_empty());
        let events = decoder.process(b"\n").unwrap();
        assert_eq!(last_content(&events), Some("hello"));
        assert_eq!(decoder.buffer_size(), 0);
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut decoder = SseFrameDecoder::new();
        let data = frame(r#"{"content":"流程图"}"#);
        let bytes = data.as_bytes();
        // 在 "流" 的三字节编码中间切断
        let split = data.find('流').unwrap() + 1;
        assert!(decoder.process(&bytes[..split]).unwrap().is_empty());
        let events = decoder.process(&bytes[split..]).unwrap();
        assert_eq!(last_content(&events), Some("流程图"));
    }

    #[test]
    fn test_crlf_frames() {
        let mut decoder = SseFrameDecoder::new();
        let events = decoder
            .process(b"data: {\"content\":\"x\"}\r\n\r\n")
            .unwrap();
        assert_eq!(last_content(&events), Some("x"));
    }

    #[test]
    fn test_error_frame_terminates() {
        let mut decoder = SseFrameDecoder::new();
        let data = format!(
            "{}{}{}",
            frame(r#"{"content":"<mx"}"#),
            frame(r#"{"error":"quota exceeded"}"#),
            frame(r#"{"content":"<mxfile>"}"#)
        );
        let events = decoder.process(data.as_bytes()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::Error {
                message: "quota exceeded".to_string()
            }
        );
        assert!(matches!(decoder.state(), DecoderState::Failed(_)));

        // 终止后忽略后续输入
        assert!(decoder
            .process(frame(r#"{"content":"more"}"#).as_bytes())
            .unwrap()
            .is_empty());
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn test_error_object_message() {
        let mut decoder = SseFrameDecoder::new();
        let events = decoder
            .process(frame(r#"{"error":{"message":"bad key","code":401}}"#).as_bytes())
            .unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "bad key".to_string()
            }]
        );
    }

    #[test]
    fn test_malformed_json_fails_fast() {
        let mut decoder = SseFrameDecoder::new();
        let result = decoder.process(b"data: {\"content\":\"oops\n\n");
        assert!(matches!(result, Err(StreamError::ParseError(_))));
        assert!(matches!(decoder.state(), DecoderState::Failed(_)));
    }

    #[test]
    fn test_non_data_frames_ignored() {
        let mut decoder = SseFrameDecoder::new();
        let events = decoder
            .process(b": keep-alive\n\nevent: ping\n\ndata: {\"content\":\"a\"}\n\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(decoder.frame_count(), 3);
    }

    #[test]
    fn test_unknown_shape_ignored() {
        let mut decoder = SseFrameDecoder::new();
        let events = decoder.process(frame(r#"{"usage":12}"#).as_bytes()).unwrap();
        assert!(events.is_empty());
        assert_eq!(decoder.state(), &DecoderState::Decoding);
    }

    #[test]
    fn test_finish_drops_cut_off_frame() {
        let mut decoder = SseFrameDecoder::new();
        let data = format!("{}data: {{\"content\":\"<mxfile><diag", frame(r#"{"content":"<mxfile>"}"#));
        let events = decoder.process(data.as_bytes()).unwrap();
        assert_eq!(last_content(&events), Some("<mxfile>"));

        let tail = decoder.finish().unwrap();
        assert_eq!(tail, vec![StreamEvent::Done { sentinel: false }]);
        assert_eq!(decoder.state(), &DecoderState::Completed);
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut decoder = SseFrameDecoder::new();
        decoder.process(b"data: {\"content\":\"tail\"}").unwrap();
        let events = decoder.finish().unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta {
                    content: "tail".to_string()
                },
                StreamEvent::Done { sentinel: false },
            ]
        );
    }

    #[test]
    fn test_buffer_overflow() {
        let mut decoder = SseFrameDecoder::with_max_buffer_size(16);
        let result = decoder.process(b"data: {\"content\":\"0123456789abcdef\"");
        assert_eq!(result, Err(StreamError::BufferOverflow));
        assert!(decoder.state().is_terminal());
    }

    #[test]
    fn test_reset() {
        let mut decoder = SseFrameDecoder::new();
        decoder.process(b"data: [DONE]\n\ndata: {").unwrap();
        decoder.reset();
        assert_eq!(decoder.state(), &DecoderState::Idle);
        assert_eq!(decoder.buffer_size(), 0);
        assert!(!decoder.saw_done_sentinel());
    }

    #[test]
    fn test_take_utf8_prefix_invalid_bytes() {
        let mut bytes = vec![b'a', 0xff, b'b', 0xe6];
        let text = take_utf8_prefix(&mut bytes);
        assert_eq!(text, "a\u{fffd}b");
        assert_eq!(bytes, vec![0xe6]);
    }

    #[tokio::test]
    async fn test_decode_stream_yields_events_in_order() {
        let chunks: Vec<Result<Bytes, StreamError>> = vec![
            Ok(Bytes::from("data: {\"content\":\"<a\"}\n\nda")),
            Ok(Bytes::from("ta: {\"content\":\"<ab\"}\n\n")),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ];
        let source: StreamResponse = Box::pin(stream::iter(chunks));
        let events: Vec<_> = decode_stream(source, &StreamSettings::default())
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                Ok(StreamEvent::Delta {
                    content: "<a".to_string()
                }),
                Ok(StreamEvent::Delta {
                    content: "<ab".to_string()
                }),
                Ok(StreamEvent::Done { sentinel: true }),
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_stream_records_metrics() {
        let chunks: Vec<Result<Bytes, StreamError>> = vec![
            Ok(Bytes::from(": ping\n\ndata: {\"content\":\"<a\"}\n\n")),
            Ok(Bytes::from("data: {\"content\":\"<abc\"}\n\ndata: [DONE]\n\n")),
        ];
        let source: StreamResponse = Box::pin(stream::iter(chunks));
        let metrics = Arc::new(Mutex::new(StreamMetrics::new()));
        let events: Vec<_> =
            decode_stream_with_metrics(source, &StreamSettings::default(), metrics.clone())
                .collect()
                .await;

        assert_eq!(events.len(), 3);
        let metrics = metrics.lock();
        assert_eq!(metrics.chunks, 2);
        assert_eq!(metrics.frames, 4);
        assert_eq!(metrics.deltas, 2);
        assert_eq!(metrics.content_len, 4);
        assert!(metrics.ttfb_ms().is_some());
    }

    #[tokio::test]
    async fn test_decode_stream_transport_error() {
        let chunks: Vec<Result<Bytes, StreamError>> = vec![
            Ok(Bytes::from("data: {\"content\":\"<a\"}\n\n")),
            Err(StreamError::network("connection reset")),
            Ok(Bytes::from("data: {\"content\":\"<ab\"}\n\n")),
        ];
        let source: StreamResponse = Box::pin(stream::iter(chunks));
        let events: Vec<_> = decode_stream(source, &StreamSettings::default())
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(StreamError::Network(_))));
    }

    #[tokio::test]
    async fn test_decode_stream_chunk_timeout() {
        let source: StreamResponse = Box::pin(stream::pending::<Result<Bytes, StreamError>>());
        let settings = StreamSettings {
            chunk_timeout_ms: 20,
            ..StreamSettings::default()
        };
        let events: Vec<_> = decode_stream(source, &settings).collect().await;
        assert_eq!(events, vec![Err(StreamError::Timeout)]);
    }
}
