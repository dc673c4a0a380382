//! 单轮生成的流式指标
//!
//! 只保存原始计数与时间点，耗时类指标按需计算。轮次结束时由引擎输出到日志。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 流式指标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// 字节 chunk 数（与帧边界无关）
    pub chunks: u32,
    pub bytes: usize,
    pub largest_chunk: usize,

    /// 解码过的 SSE 帧，含 `[DONE]` 与注释帧
    pub frames: u32,
    pub deltas: u32,
    /// 最后一个 delta 的累积内容长度
    pub content_len: usize,
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn starting_at(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            first_chunk_at: None,
            finished_at: None,
            chunks: 0,
            bytes: 0,
            largest_chunk: 0,
            frames: 0,
            deltas: 0,
            content_len: 0,
        }
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.first_chunk_at.get_or_insert_with(Utc::now);
        self.chunks += 1;
        self.bytes += len;
        self.largest_chunk = self.largest_chunk.max(len);
    }

    pub fn record_frames(&mut self, count: usize) {
        self.frames = self.frames.saturating_add(u32::try_from(count).unwrap_or(u32::MAX));
    }

    pub fn record_delta(&mut self, content_len: usize) {
        self.deltas += 1;
        self.content_len = content_len;
    }

    /// 标记结束，重复调用保留第一次的时间
    pub fn finish(&mut self) {
        self.finished_at.get_or_insert_with(Utc::now);
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// 首字节时间，没有收到任何 chunk 时为 None
    pub fn ttfb_ms(&self) -> Option<u64> {
        self.first_chunk_at
            .map(|first| millis_between(self.started_at, first))
    }

    /// 总耗时；尚未结束时计算到当前时间
    pub fn duration_ms(&self) -> u64 {
        millis_between(self.started_at, self.finished_at.unwrap_or_else(Utc::now))
    }

    /// 每个 delta 平均新增的字节数
    pub fn growth_per_delta(&self) -> Option<usize> {
        (self.deltas > 0).then(|| self.content_len / self.deltas as usize)
    }

    pub fn log_metrics(&self, turn_id: &str) {
        info!(
            turn_id = turn_id,
            chunks = self.chunks,
            bytes = self.bytes,
            largest_chunk = self.largest_chunk,
            frames = self.frames,
            deltas = self.deltas,
            content_len = self.content_len,
            ttfb_ms = ?self.ttfb_ms(),
            duration_ms = self.duration_ms(),
            "流式生成指标"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_fresh_metrics() {
        let metrics = StreamMetrics::new();
        assert_eq!(metrics.chunks, 0);
        assert_eq!(metrics.ttfb_ms(), None);
        assert_eq!(metrics.growth_per_delta(), None);
        assert!(!metrics.is_finished());
    }

    #[test]
    fn test_chunk_accounting() {
        let mut metrics = StreamMetrics::starting_at(Utc::now() - Duration::milliseconds(50));
        for len in [12, 300, 40] {
            metrics.record_chunk(len);
        }

        assert_eq!(metrics.chunks, 3);
        assert_eq!(metrics.bytes, 352);
        assert_eq!(metrics.largest_chunk, 300);
        assert!(metrics.ttfb_ms().unwrap() >= 50);
    }

    #[test]
    fn test_delta_tracks_latest_length() {
        let mut metrics = StreamMetrics::new();
        metrics.record_frames(4);
        metrics.record_delta(10);
        metrics.record_delta(30);

        assert_eq!(metrics.frames, 4);
        assert_eq!(metrics.deltas, 2);
        assert_eq!(metrics.content_len, 30);
        assert_eq!(metrics.growth_per_delta(), Some(15));
    }

    #[test]
    fn test_finish_is_sticky() {
        let mut metrics = StreamMetrics::new();
        metrics.finish();
        let first = metrics.finished_at;
        metrics.finish();
        assert_eq!(metrics.finished_at, first);
        assert!(metrics.duration_ms() < 60_000);
    }

    #[test]
    fn test_serialized_form_omits_missing_times() {
        let metrics = StreamMetrics::new();
        let value = serde_json::to_value(&metrics).unwrap();
        assert!(value.get("first_chunk_at").is_none());
        assert!(value.get("finished_at").is_none());

        let back: StreamMetrics = serde_json::from_value(value).unwrap();
        assert_eq!(back.started_at, metrics.started_at);
    }
}
