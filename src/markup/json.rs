//! JSON 词法扫描与结构修复
//!
//! 词法器只关心 `{}` / `[]` 的嵌套以及字符串边界（含转义引号），
//! 字符串内部的内容一律视为不透明。

use super::continuation::Outline;
use super::dialect::BalanceReport;
use serde_json::Value;
use std::cmp::Reverse;
use tracing::debug;

const LITERALS: [&str; 3] = ["true", "false", "null"];

fn closer_for(open: char) -> char {
    if open == '{' {
        '}'
    } else {
        ']'
    }
}

// ============================================================================
// 修复
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct RepairFrame {
    closer: char,
    /// 对象中下一个字符串是键
    expecting_key: bool,
    /// 已读完键但还没有遇到 `:`
    pending_key: bool,
}

impl RepairFrame {
    fn new(open: char) -> Self {
        Self {
            closer: closer_for(open),
            expecting_key: open == '{',
            pending_key: false,
        }
    }

    fn is_object(&self) -> bool {
        self.closer == '}'
    }
}

/// 修复 JSON 结构
///
/// - 未闭合的字符串补 `"`（末尾悬空的 `\` 先去掉）
/// - 未闭合的对象 / 数组按内层优先补齐闭合符
/// - 闭合符前悬空的 `,` 去掉；悬空的 `:` 或键补 `null`
/// - 截断的 `true` / `false` / `null` 补全，截断的数字去掉不完整的尾部
/// - 与栈顶不匹配的闭合符先隐式闭合内层；没有对应开启的闭合符丢弃
pub(crate) fn repair(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut stack: Vec<RepairFrame> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                end_string(&mut stack);
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' | '[' => {
                stack.push(RepairFrame::new(ch));
                out.push(ch);
            }
            '}' | ']' => {
                if let Some(idx) = stack.iter().rposition(|f| f.closer == ch) {
                    while stack.len() > idx {
                        if let Some(frame) = stack.pop() {
                            close_frame(&mut out, &frame);
                        }
                    }
                }
            }
            ':' => {
                if let Some(top) = stack.last_mut() {
                    top.pending_key = false;
                    top.expecting_key = false;
                }
                out.push(ch);
            }
            ',' => {
                if let Some(top) = stack.last_mut() {
                    if top.is_object() {
                        top.expecting_key = true;
                    }
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
        end_string(&mut stack);
    }

    while let Some(frame) = stack.pop() {
        close_frame(&mut out, &frame);
    }
    out
}

fn end_string(stack: &mut [RepairFrame]) {
    if let Some(top) = stack.last_mut() {
        if top.is_object() && top.expecting_key {
            top.expecting_key = false;
            top.pending_key = true;
        }
    }
}

fn close_frame(out: &mut String, frame: &RepairFrame) {
    if frame.pending_key {
        let len = out.trim_end().len();
        out.truncate(len);
        out.push_str(":null");
    } else {
        fix_dangling_tail(out);
    }
    out.push(frame.closer);
}

/// 修正闭合符之前的悬空内容
fn fix_dangling_tail(out: &mut String) {
    loop {
        let trimmed_len = out.trim_end().len();
        let tail = &out[..trimmed_len];

        if tail.ends_with(',') {
            out.truncate(trimmed_len - 1);
            continue;
        }
        if tail.ends_with(':') {
            out.truncate(trimmed_len);
            out.push_str("null");
            return;
        }

        let run_start = tail
            .trim_end_matches(|c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
            .len();
        let run = &tail[run_start..];
        if run.is_empty() {
            return;
        }

        if run.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
            let kept = run.trim_end_matches(['+', '-', '.', 'e', 'E']);
            if kept.len() == run.len() {
                return;
            }
            out.truncate(run_start + kept.len());
            continue;
        }

        if LITERALS.contains(&run) {
            return;
        }
        if let Some(literal) = LITERALS.iter().find(|lit| lit.starts_with(run)) {
            let rest = &literal[run.len()..];
            out.truncate(trimmed_len);
            out.push_str(rest);
            return;
        }
        out.truncate(run_start);
    }
}

// ============================================================================
// 平衡检查
// ============================================================================

/// 栈式平衡检查
pub(crate) fn check_balance(text: &str) -> BalanceReport {
    let mut report = BalanceReport::default();
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => stack.push(closer_for(ch)),
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                } else if let Some(idx) = stack.iter().rposition(|c| *c == ch) {
                    report.mismatched += 1;
                    stack.truncate(idx);
                } else {
                    report.stray += 1;
                }
            }
            _ => {}
        }
    }

    report.unterminated_string = in_string;
    report.unclosed = stack.iter().rev().map(|c| c.to_string()).collect();
    report
}

/// 从 `start` 处的 `[` 或 `{` 开始，返回与之匹配的闭合符位置
pub(crate) fn matching_close(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + i);
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// 续写结构分析
// ============================================================================

struct Frame {
    closer: char,
    depth: usize,
    item_start: Option<usize>,
    last_end: usize,
    children: Vec<(usize, usize)>,
}

impl Frame {
    fn is_array(&self) -> bool {
        self.closer == ']'
    }

    fn finish_item(&mut self) {
        if let Some(start) = self.item_start.take() {
            if self.last_end > start {
                self.children.push((start, self.last_end));
            }
        }
    }
}

/// 分析文本的开放结构与完整的兄弟值
///
/// 一个值在遇到其后的 `,`（或所在容器闭合）时才算完整。
/// 结构单元取自最外层的开放数组（`{"elements":[...]}` 包装时即元素数组），
/// 没有开放数组时取最外层的开放容器；正在书写的内层对象本身就是未完成的单元。
/// 文档已完整时改为在已闭合的容器中选择最浅的数组。
pub(crate) fn outline(text: &str) -> Outline {
    let mut stack: Vec<Frame> = Vec::new();
    let mut closed: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        let next = i + ch.len_utf8();
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                if let Some(top) = stack.last_mut() {
                    top.last_end = next;
                }
            }
            continue;
        }

        match ch {
            '}' | ']' => {
                let Some(idx) = stack.iter().rposition(|f| f.closer == ch) else {
                    continue;
                };
                while stack.len() > idx {
                    let Some(mut frame) = stack.pop() else { break };
                    frame.finish_item();
                    closed.push(frame);
                }
                if let Some(parent) = stack.last_mut() {
                    parent.last_end = next;
                }
            }
            ',' => {
                if let Some(top) = stack.last_mut() {
                    top.finish_item();
                }
            }
            c if c.is_whitespace() => {}
            _ => {
                if let Some(top) = stack.last_mut() {
                    if top.item_start.is_none() && ch != ':' {
                        top.item_start = Some(i);
                    }
                    if ch != ':' {
                        top.last_end = next;
                    }
                }
                match ch {
                    '"' => in_string = true,
                    '{' | '[' => {
                        let depth = stack.len() + 1;
                        stack.push(Frame {
                            closer: closer_for(ch),
                            depth,
                            item_start: None,
                            last_end: next,
                            children: Vec::new(),
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    let mut closers: Vec<String> = stack.iter().rev().map(|f| f.closer.to_string()).collect();
    if in_string {
        closers.insert(0, "\"".to_string());
    }

    let units = if stack.is_empty() {
        closed
            .into_iter()
            .min_by_key(|f| (!f.is_array(), f.depth, Reverse(f.children.len())))
            .map(|f| f.children)
            .unwrap_or_default()
    } else {
        let idx = stack.iter().position(Frame::is_array).unwrap_or(0);
        stack.swap_remove(idx).children
    };

    Outline {
        closers,
        units,
        in_string,
    }
}

// ============================================================================
// Excalidraw 元素
// ============================================================================

/// 从修复后的 JSON 中取出元素数组
///
/// 顶层是数组时直接返回；顶层是对象时取 `elements` 或 `items` 字段；
/// 其余情况（含解析失败）返回空列表。
pub fn parse_elements(repaired: &str) -> Vec<Value> {
    let value: Value = match serde_json::from_str(repaired) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Excalidraw JSON 解析失败");
            return Vec::new();
        }
    };

    match value {
        Value::Array(elements) => elements,
        Value::Object(mut map) => ["elements", "items"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(elements)) => Some(elements),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

// ============================================================================
// 测试模块
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repair_scenario_truncated_string() {
        let input = r#"[{"id":"a","type":"rectangle"},{"id":"b","type":"text"#;
        assert_eq!(
            repair(input),
            r#"[{"id":"a","type":"rectangle"},{"id":"b","type":"text"}]"#
        );
    }

    #[test]
    fn test_repair_dangling_comma() {
        assert_eq!(repair("[1,2,"), "[1,2]");
        assert_eq!(repair("[1,2,]"), "[1,2]");
        assert_eq!(repair(r#"{"a":1, }"#), r#"{"a":1}"#);
    }

    #[test]
    fn test_repair_dangling_key_and_colon() {
        assert_eq!(repair(r#"{"a":1,"b""#), r#"{"a":1,"b":null}"#);
        assert_eq!(repair(r#"{"a":1,"b":"#), r#"{"a":1,"b":null}"#);
        assert_eq!(repair(r#"{"a"#), r#"{"a":null}"#);
    }

    #[test]
    fn test_repair_partial_literals_and_numbers() {
        assert_eq!(repair(r#"{"a":tr"#), r#"{"a":true}"#);
        assert_eq!(repair(r#"[fals"#), r#"[false]"#);
        assert_eq!(repair(r#"{"a":nu"#), r#"{"a":null}"#);
        assert_eq!(repair(r#"{"x":12."#), r#"{"x":12}"#);
        assert_eq!(repair(r#"{"x":1e"#), r#"{"x":1}"#);
        assert_eq!(repair(r#"[1,-"#), r#"[1]"#);
        assert_eq!(repair(r#"{"x":-"#), r#"{"x":null}"#);
    }

    #[test]
    fn test_repair_escapes_in_string() {
        assert_eq!(repair(r#"["a\"b"#), r#"["a\"b"]"#);
        assert_eq!(repair(r#"["ab\"#), r#"["ab"]"#);
        assert_eq!(repair(r#"{"t":"{[not structure"#), r#"{"t":"{[not structure"}"#);
    }

    #[test]
    fn test_repair_mismatched_and_stray() {
        assert_eq!(repair(r#"{"a":[1,2}"#), r#"{"a":[1,2]}"#);
        assert_eq!(repair("[1]]"), "[1]");
    }

    #[test]
    fn test_repair_well_formed_unchanged() {
        let input = r#"{"type":"excalidraw","elements":[{"id":"a","x":1.5e3,"locked":false,"link":null}], "appState": {}}"#;
        assert_eq!(repair(input), input);
    }

    #[test]
    fn test_repaired_output_parses() {
        let repaired = repair(r#"{"elements":[{"id":"a","points":[[0,0],[1"#);
        let value: Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(value["elements"][0]["points"], json!([[0, 0], [1]]));
    }

    #[test]
    fn test_check_balance() {
        let report = check_balance(r#"[{"a":"b"#);
        assert!(report.unterminated_string);
        assert_eq!(report.unclosed, vec!["}".to_string(), "]".to_string()]);

        let report = check_balance("[}]]");
        assert_eq!(report.stray, 2);
    }

    #[test]
    fn test_matching_close() {
        let text = r#"xx [1, "]", {"a": [2]}] tail ]"#;
        let start = text.find('[').unwrap();
        let end = matching_close(text, start).unwrap();
        assert_eq!(&text[start..=end], r#"[1, "]", {"a": [2]}]"#);
        assert_eq!(matching_close("[1, [2", 0), None);
    }

    #[test]
    fn test_outline_truncated_array() {
        let text = r#"[{"id":"a"},{"id":"b","x":[1,2]},{"id":"c"},{"id":"d","ty"#;
        let outline = outline(text);
        assert_eq!(outline.closers, vec!["\"", "}", "]"]);
        assert!(outline.in_string);
        let units: Vec<&str> = outline.units.iter().map(|(s, e)| &text[*s..*e]).collect();
        assert_eq!(
            units,
            vec![r#"{"id":"a"}"#, r#"{"id":"b","x":[1,2]}"#, r#"{"id":"c"}"#]
        );
    }

    #[test]
    fn test_outline_prefers_element_array() {
        let text = r#"{"type":"excalidraw","elements":[{"id":"a"},{"id":"b"},{"id":"c"},"#;
        let outline = outline(text);
        assert_eq!(outline.closers, vec!["]", "}"]);
        assert_eq!(outline.units.len(), 3);
    }

    fn unit_texts<'a>(text: &'a str, outline: &Outline) -> Vec<&'a str> {
        outline.units.iter().map(|(s, e)| &text[*s..*e]).collect()
    }

    #[test]
    fn test_outline_ignores_object_being_written() {
        let text = r#"[{"id":"a","type":"rectangle"},{"id":"b","type":"text"#;
        assert_eq!(
            unit_texts(text, &outline(text)),
            vec![r#"{"id":"a","type":"rectangle"}"#]
        );

        let text = r#"{"elements":[{"id":"a"},{"id":"b","x":1,"y":2"#;
        let result = outline(text);
        assert_eq!(result.closers, vec!["}", "]", "}"]);
        assert_eq!(unit_texts(text, &result), vec![r#"{"id":"a"}"#]);
    }

    #[test]
    fn test_outline_complete_document_uses_element_array() {
        let text = r#"{"type":"excalidraw","elements":[{"id":"a","points":[[0,0],[1,1],[2,2]]},{"id":"b"}],"appState":{}}"#;
        let result = outline(text);
        assert!(result.closers.is_empty());
        assert_eq!(
            unit_texts(text, &result),
            vec![r#"{"id":"a","points":[[0,0],[1,1],[2,2]]}"#, r#"{"id":"b"}"#]
        );
    }

    #[test]
    fn test_parse_elements() {
        assert_eq!(parse_elements(r#"[{"id":"a"}]"#).len(), 1);
        assert_eq!(parse_elements(r#"{"elements":[{"id":"a"},{"id":"b"}]}"#).len(), 2);
        assert_eq!(parse_elements(r#"{"items":[{"id":"a"}]}"#).len(), 1);
        assert!(parse_elements(r#"{"foo":1}"#).is_empty());
        assert!(parse_elements("not json").is_empty());
    }
}
