//! 内容累积器
//!
//! 保存单轮生成截至目前的完整文本。上游每个 delta 帧携带的是累积内容，
//! 因此应用 delta 时直接替换缓冲区，而不是追加。
//!
//! 每次应用 delta 后同步回调一次更新监听器，供界面实时预览。
//! 收到 Done 或 Error 后缓冲区冻结，后续事件全部忽略。

use crate::streaming::sse_decoder::StreamEvent;
use std::fmt;

/// 内容更新监听器
pub type UpdateListener = Box<dyn FnMut(&str) + Send>;

/// 内容累积器
pub struct ContentAccumulator {
    buffer: String,
    frozen: bool,
    delta_count: usize,
    listener: Option<UpdateListener>,
}

impl fmt::Debug for ContentAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentAccumulator")
            .field("buffer_len", &self.buffer.len())
            .field("frozen", &self.frozen)
            .field("delta_count", &self.delta_count)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

impl Default for ContentAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentAccumulator {
    /// 创建空的累积器
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            frozen: false,
            delta_count: 0,
            listener: None,
        }
    }

    /// 创建带更新监听器的累积器
    pub fn with_listener<F>(listener: F) -> Self
    where
        F: FnMut(&str) + Send + 'static,
    {
        Self {
            listener: Some(Box::new(listener)),
            ..Self::new()
        }
    }

    /// 应用一个流事件
    ///
    /// 返回缓冲区是否发生变化（即是否应用了一个 delta）。
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        if self.frozen {
            return false;
        }

        match event {
            StreamEvent::Delta { content } => {
                self.buffer.clear();
                self.buffer.push_str(content);
                self.delta_count += 1;
                if let Some(listener) = self.listener.as_mut() {
                    listener(&self.buffer);
                }
                true
            }
            StreamEvent::Done { .. } | StreamEvent::Error { .. } => {
                self.frozen = true;
                false
            }
        }
    }

    /// 当前累积的内容
    pub fn current(&self) -> &str {
        &self.buffer
    }

    /// 冻结缓冲区
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// 是否已冻结
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// 已应用的 delta 数量
    pub fn delta_count(&self) -> usize {
        self.delta_count
    }

    /// 取出缓冲区内容
    pub fn into_buffer(self) -> String {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn delta(content: &str) -> StreamEvent {
        StreamEvent::Delta {
            content: content.to_string(),
        }
    }

    #[test]
    fn test_delta_replaces_buffer() {
        let mut acc = ContentAccumulator::new();
        assert!(acc.apply(&delta("<a")));
        assert!(acc.apply(&delta("<ab")));
        assert_eq!(acc.current(), "<ab");
        assert_eq!(acc.delta_count(), 2);
    }

    #[test]
    fn test_listener_called_once_per_delta() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut acc = ContentAccumulator::with_listener(move |text| sink.lock().push(text.to_string()));

        acc.apply(&delta("<a"));
        acc.apply(&delta("<ab"));
        acc.apply(&StreamEvent::Done { sentinel: true });

        assert_eq!(*seen.lock(), vec!["<a".to_string(), "<ab".to_string()]);
    }

    #[test]
    fn test_frozen_after_done() {
        let mut acc = ContentAccumulator::new();
        acc.apply(&delta("<a"));
        acc.apply(&StreamEvent::Done { sentinel: false });
        assert!(acc.is_frozen());

        assert!(!acc.apply(&delta("<abc")));
        assert_eq!(acc.current(), "<a");
    }

    #[test]
    fn test_frozen_after_error() {
        let mut acc = ContentAccumulator::new();
        acc.apply(&delta("partial"));
        acc.apply(&StreamEvent::Error {
            message: "boom".to_string(),
        });
        assert!(acc.is_frozen());
        assert_eq!(acc.into_buffer(), "partial");
    }

    #[test]
    fn test_empty_stream() {
        let mut acc = ContentAccumulator::new();
        acc.apply(&StreamEvent::Done { sentinel: true });
        assert_eq!(acc.current(), "");
        assert_eq!(acc.delta_count(), 0);
    }
}
