//! 续写上下文构建
//!
//! 生成被截断（缺少顶层闭合符，或流在没有 `[DONE]` 的情况下结束）时，
//! 从截断前的文本中提取：
//!
//! - 最后 k 个完整结构单元，以及最后一个单元之后未完成的尾部
//! - 下一个可用的数字 id（严格大于文本中出现过的所有 id）
//! - 仍然缺失的闭合符，内层在前、最外层在后
//!
//! 闭合符必须基于修复前的文本计算，修复后的文本总是完整的。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::compile;
use super::dialect::Dialect;
use super::{json, xml};

/// 续写上下文
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationContext {
    /// 方言
    pub dialect: Dialect,
    /// 最后 k 个完整结构单元，按文档顺序排列
    pub trailing_units: Vec<String>,
    /// 最后一个完整单元之后的未完成内容
    pub incomplete_tail: String,
    /// 下一个可用的数字 id
    pub next_id: u64,
    /// 缺失的闭合符，内层在前
    pub missing_closers: Vec<String>,
}

impl ContinuationContext {
    /// 是否确实缺少闭合符
    pub fn is_truncated(&self) -> bool {
        !self.missing_closers.is_empty()
    }

    /// 当前出现过的最大 id
    pub fn max_id(&self) -> u64 {
        self.next_id.saturating_sub(1)
    }
}

/// 文本结构概要（方言扫描器的输出）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Outline {
    /// 缺失的闭合符，内层在前
    pub closers: Vec<String>,
    /// 被选中容器内的完整单元（字节区间）
    pub units: Vec<(usize, usize)>,
    /// 文本是否结束在字符串内部（仅 JSON）
    pub in_string: bool,
}

fn outline(text: &str, dialect: Dialect) -> Outline {
    match dialect {
        Dialect::Xml => xml::outline(text),
        Dialect::Json => json::outline(text),
    }
}

/// 构建续写上下文
///
/// `text` 应为修复前的提取结果；`units` 为保留的完整单元数。
pub fn build_context(text: &str, dialect: Dialect, units: usize) -> ContinuationContext {
    let outline = outline(text, dialect);

    let keep_from = outline.units.len().saturating_sub(units);
    let trailing_units = outline.units[keep_from..]
        .iter()
        .map(|(start, end)| text[*start..*end].to_string())
        .collect();
    let tail_start = outline.units.last().map(|(_, end)| *end).unwrap_or(0);
    let mut tail = text[tail_start..].trim();
    if dialect == Dialect::Json {
        // 兄弟值之间的分隔符不属于未完成的值
        tail = tail.trim_start_matches(',').trim_start();
    }

    ContinuationContext {
        dialect,
        trailing_units,
        incomplete_tail: tail.to_string(),
        next_id: next_id(text, dialect),
        missing_closers: outline.closers,
    }
}

/// 修复前文本中缺失的闭合符，内层在前
pub fn missing_closers(text: &str, dialect: Dialect) -> Vec<String> {
    outline(text, dialect).closers
}

/// 文本是否缺少闭合符
pub fn is_truncated(text: &str, dialect: Dialect) -> bool {
    !missing_closers(text, dialect).is_empty()
}

/// XML 的 `id="12"` 属性
static XML_ID: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r#"(?:^|[\s<"'])id\s*=\s*["'](\d+)["']"#));

/// JSON 的 `"id": 12` 或 `"id": "12"` 字段
static JSON_ID: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r#""id"\s*:\s*(?:"(\d+)"|(\d+))"#));

/// 下一个可用的数字 id
///
/// 只统计名为 `id` 的属性 / 字段。XML 中没有任何 id 时视为最大 id 为 2
/// （draw.io 固定的 `0`、`1` 两个单元之后），JSON 中从 1 开始。
pub fn next_id(text: &str, dialect: Dialect) -> u64 {
    let pattern = match dialect {
        Dialect::Xml => &*XML_ID,
        Dialect::Json => &*JSON_ID,
    };

    let max = pattern.as_ref().and_then(|re| {
        re.captures_iter(text)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
            .filter_map(|m| m.as_str().parse::<u64>().ok())
            .max()
    });

    match max.or(dialect.implicit_max_id()) {
        Some(max) => max.saturating_add(1),
        None => 1,
    }
}

// ============================================================================
// 测试模块
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_XML: &str = r#"<mxfile><diagram><mxGraphModel><root><mxCell id="0"/><mxCell id="1" parent="0"/><mxCell id="5" value="Start""#;

    #[test]
    fn test_build_context_truncated_xml() {
        let ctx = build_context(SCENARIO_XML, Dialect::Xml, 3);
        assert_eq!(
            ctx.missing_closers,
            vec!["</root>", "</mxGraphModel>", "</diagram>", "</mxfile>"]
        );
        assert_eq!(ctx.next_id, 6);
        assert_eq!(ctx.max_id(), 5);
        assert_eq!(
            ctx.trailing_units,
            vec![r#"<mxCell id="0"/>"#, r#"<mxCell id="1" parent="0"/>"#]
        );
        assert_eq!(ctx.incomplete_tail, r#"<mxCell id="5" value="Start""#);
        assert!(ctx.is_truncated());
    }

    #[test]
    fn test_build_context_keeps_last_k_units() {
        let text = r#"<mxfile><diagram><mxGraphModel><root><mxCell id="0"/><mxCell id="1"/><mxCell id="2"/><mxCell id="3"/><mxCell id="4"/></root>"#;
        let ctx = build_context(text, Dialect::Xml, 3);
        assert_eq!(
            ctx.trailing_units,
            vec![
                r#"<mxCell id="2"/>"#,
                r#"<mxCell id="3"/>"#,
                r#"<mxCell id="4"/>"#
            ]
        );
        assert_eq!(ctx.incomplete_tail, "</root>");
        assert_eq!(
            ctx.missing_closers,
            vec!["</mxGraphModel>", "</diagram>", "</mxfile>"]
        );
    }

    #[test]
    fn test_build_context_json() {
        let text = r#"[{"id":"a","type":"rectangle"},{"id":"b","type":"text"#;
        let ctx = build_context(text, Dialect::Json, 3);
        assert_eq!(ctx.missing_closers, vec!["\"", "}", "]"]);
        assert_eq!(ctx.trailing_units, vec![r#"{"id":"a","type":"rectangle"}"#]);
        assert_eq!(ctx.incomplete_tail, r#"{"id":"b","type":"text"#);
        assert_eq!(ctx.next_id, 1);
    }

    #[test]
    fn test_build_context_json_element_wrapper() {
        let text = r#"{"elements":[{"id":"a"},{"id":"b","x":1,"y":2"#;
        let ctx = build_context(text, Dialect::Json, 3);
        assert_eq!(ctx.trailing_units, vec![r#"{"id":"a"}"#]);
        assert_eq!(ctx.incomplete_tail, r#"{"id":"b","x":1,"y":2"#);
        assert_eq!(ctx.missing_closers, vec!["}", "]", "}"]);
    }

    #[test]
    fn test_build_context_xml_inside_open_cell() {
        let text = concat!(
            r#"<mxfile><diagram><mxGraphModel><root>"#,
            r#"<mxCell id="0"/><mxCell id="1" parent="0"/><mxCell id="2" vertex="1"/>"#,
            r#"<mxCell id="3" edge="1"><mxGeometry x="5" as="geometry"/><mxPoint x="1"/><mxPoint x="2"/>"#,
        );
        let ctx = build_context(text, Dialect::Xml, 3);
        assert_eq!(
            ctx.trailing_units,
            vec![
                r#"<mxCell id="0"/>"#,
                r#"<mxCell id="1" parent="0"/>"#,
                r#"<mxCell id="2" vertex="1"/>"#
            ]
        );
        assert!(ctx.incomplete_tail.starts_with(r#"<mxCell id="3" edge="1">"#));
        assert!(ctx.incomplete_tail.ends_with(r#"<mxPoint x="2"/>"#));
        assert_eq!(ctx.next_id, 4);
    }

    #[test]
    fn test_missing_closers_complete_document() {
        assert!(missing_closers("<mxfile><diagram/></mxfile>", Dialect::Xml).is_empty());
        assert!(!is_truncated(r#"{"elements":[]}"#, Dialect::Json));
        assert!(is_truncated(r#"{"elements":["#, Dialect::Json));
    }

    #[test]
    fn test_next_id_xml() {
        // 没有任何 id 时按 draw.io 的默认单元计，最大 id 视为 2
        assert_eq!(next_id("<mxfile></mxfile>", Dialect::Xml), 3);
        assert_eq!(next_id(r#"<mxCell id="0"/><mxCell id="1"/>"#, Dialect::Xml), 2);
        assert_eq!(next_id(r#"<mxCell id='41' parent="7"/>"#, Dialect::Xml), 42);
        // 只统计 id 属性
        assert_eq!(
            next_id(r#"<mxCell id="3" source="99" gridSize="10" value="id=&quot;500&quot;"/>"#, Dialect::Xml),
            4
        );
    }

    #[test]
    fn test_next_id_json() {
        assert_eq!(next_id(r#"[{"id":"abc"}]"#, Dialect::Json), 1);
        assert_eq!(next_id(r#"[{"id":"7"},{"id": 12},{"seed":999}]"#, Dialect::Json), 13);
    }

    #[test]
    fn test_next_id_saturates() {
        let text = format!(r#"<mxCell id="{}"/>"#, u64::MAX);
        assert_eq!(next_id(&text, Dialect::Xml), u64::MAX);
    }
}
