//! 代码提取
//!
//! 从模型输出（可能仍在增长）中取出真正的标记文本：
//! 清理不可见字符、选择代码块、按需反转义、按方言收窄边界。
//! 每一步不适用时都原样跳过，提取过程不会失败。

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

use super::compile;
use super::dialect::Dialect;
use super::json;
use super::payload::ExtractedPayload;

// ============================================================================
// 正则
// ============================================================================

static XML_FENCE: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"(?is)```[ \t]*xml\b[ \t]*\r?\n?(.*?)```"));

static JSON_FENCE: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"(?is)```[ \t]*json\b[ \t]*\r?\n?(.*?)```"));

static ANY_FENCE: Lazy<Option<Regex>> = Lazy::new(|| compile(r"(?s)```[^\n`]*\r?\n(.*?)```"));

/// 流式输出中尚未闭合的代码块
static OPEN_FENCE: Lazy<Option<Regex>> = Lazy::new(|| compile(r"(?s)```[^\n`]*\r?\n(.*)$"));

/// 续写输出中的围栏标记
static FENCE_MARKER: Lazy<Option<Regex>> = Lazy::new(|| compile(r"(?i)```(?:xml|json)?[ \t]*\r?\n?"));

static LITERAL_TAG: Lazy<Option<Regex>> = Lazy::new(|| compile(r"<[A-Za-z!?/]"));

static ESCAPED_TAG: Lazy<Option<Regex>> = Lazy::new(|| compile(r"&lt;\s*[A-Za-z!?/]"));

static ENTITY: Lazy<Option<Regex>> = Lazy::new(|| compile(r"&(lt|gt|amp|quot|#39);"));

static XML_ROOT: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"(?i)<(mxfile|mxGraphModel|diagram)(?:[\s>/]|$)"));

static TAG_CASE: Lazy<Option<Regex>> = Lazy::new(|| {
    compile(
        r"(?i)(</?)(mxfile|diagram|mxgraphmodel|root|mxcell|mxgeometry|mxpoint|array|userobject|mxrectangle)([\s/>]|$)",
    )
});

/// draw.io 标签的规范大小写
fn canonical_tag(name: &str) -> &'static str {
    match name.to_ascii_lowercase().as_str() {
        "mxfile" => "mxfile",
        "diagram" => "diagram",
        "mxgraphmodel" => "mxGraphModel",
        "root" => "root",
        "mxcell" => "mxCell",
        "mxgeometry" => "mxGeometry",
        "mxpoint" => "mxPoint",
        "array" => "Array",
        "userobject" => "UserObject",
        _ => "mxRectangle",
    }
}

// ============================================================================
// 提取
// ============================================================================

/// 从原始输出中提取标记文本
///
/// 找不到方言边界时返回清理并去除首尾空白后的文本。
pub fn extract(raw: &str, dialect: Dialect) -> ExtractedPayload {
    let cleaned = strip_invisible(raw);
    let candidate = select_block(&cleaned, dialect);
    let unescaped = unescape_if_needed(candidate.trim(), dialect);

    let narrowed = match dialect {
        Dialect::Xml => normalize_tag_case(narrow_xml(&unescaped)),
        Dialect::Json => narrow_json(&unescaped).to_string(),
    };

    let payload = narrowed.trim();
    debug!(
        dialect = %dialect,
        raw_len = raw.len(),
        extracted_len = payload.len(),
        "已提取标记文本"
    );
    ExtractedPayload::new(payload)
}

/// 去掉文本中所有的代码块围栏标记
///
/// 续写结果直接拼接到已有内容之后，不能带有 `` ```xml `` 之类的标记。
pub fn strip_fences(text: &str) -> String {
    match FENCE_MARKER.as_ref() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.replace("```", ""),
    }
}

/// 去掉 BOM 与零宽字符
fn strip_invisible(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '\u{feff}' | '\u{200b}'..='\u{200d}' | '\u{2060}'))
        .collect()
}

fn first_capture<'t>(pattern: &Lazy<Option<Regex>>, text: &'t str) -> Option<&'t str> {
    pattern
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// 选择代码块
///
/// 依次尝试：方言标记的代码块、任意完整代码块、尚未闭合的代码块、整段文本。
fn select_block(text: &str, dialect: Dialect) -> &str {
    let tagged = match dialect {
        Dialect::Xml => &XML_FENCE,
        Dialect::Json => &JSON_FENCE,
    };

    if let Some(block) = first_capture(tagged, text).or_else(|| first_capture(&ANY_FENCE, text)) {
        return block;
    }

    match first_capture(&OPEN_FENCE, text) {
        // 流式过程中结尾可能是半个围栏
        Some(block) => block.trim_end().trim_end_matches('`'),
        None => text,
    }
}

fn is_match(pattern: &Lazy<Option<Regex>>, text: &str) -> bool {
    pattern.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
}

/// 只有转义形式、没有字面结构字符时才反转义
fn unescape_if_needed(text: &str, dialect: Dialect) -> String {
    let escaped = match dialect {
        Dialect::Xml => !is_match(&LITERAL_TAG, text) && is_match(&ESCAPED_TAG, text),
        Dialect::Json => text.contains("&quot;") && !text.contains('"'),
    };
    if !escaped {
        return text.to_string();
    }

    debug!(dialect = %dialect, "检测到 HTML 转义的标记文本，执行反转义");
    match ENTITY.as_ref() {
        // 单次替换，`&amp;lt;` 只还原为 `&lt;`
        Some(re) => re
            .replace_all(text, |caps: &Captures| match &caps[1] {
                "lt" => "<",
                "gt" => ">",
                "amp" => "&",
                "quot" => "\"",
                _ => "'",
            })
            .into_owned(),
        None => text.to_string(),
    }
}

/// XML 边界：从第一个根元素开始
///
/// 结束位置优先取该根元素自身的闭合标签；没有时取最后一个 `>`，
/// 但 `>` 之后若是被截断的标签则保留到文本末尾。
fn narrow_xml(text: &str) -> &str {
    let Some(root) = XML_ROOT.as_ref().and_then(|re| re.captures(text)) else {
        return text;
    };
    let (Some(whole), Some(name)) = (root.get(0), root.get(1)) else {
        return text;
    };
    let start = whole.start();

    // ASCII 小写不改变字节偏移
    let lower = text.to_ascii_lowercase();
    let closing = format!("</{}", name.as_str().to_ascii_lowercase());
    if let Some(close_at) = lower[start..].rfind(&closing).map(|i| start + i) {
        return match text[close_at..].find('>') {
            Some(gt) => &text[start..close_at + gt + 1],
            None => &text[start..],
        };
    }

    match text[start..].rfind('>').map(|i| start + i) {
        Some(gt) if !text[gt + 1..].trim_start().starts_with('<') => &text[start..=gt],
        _ => &text[start..],
    }
}

/// 修正 draw.io 标签名的大小写，只作用于 `<` 或 `</` 之后的标签名
fn normalize_tag_case(text: &str) -> String {
    match TAG_CASE.as_ref() {
        Some(re) => re
            .replace_all(text, |caps: &Captures| {
                format!("{}{}{}", &caps[1], canonical_tag(&caps[2]), &caps[3])
            })
            .into_owned(),
        None => text.to_string(),
    }
}

/// JSON 边界：数组先于对象出现时按数组框定，否则按对象框定
///
/// 结束位置为最后一个同类闭合符（`]` 或 `}`）。字符串感知的深度扫描找到的
/// 同类闭合符更靠前时以它为准；括号全部匹配但尚未闭合（截断）时保留到文本末尾，
/// 内层已闭合的 `]` 不能作为边界。
fn narrow_json(text: &str) -> &str {
    let array = text.find('[');
    let object = text.find('{');

    let start = match (array, object) {
        (Some(a), Some(o)) if a < o => a,
        (_, Some(o)) => o,
        (Some(a), None) => a,
        (None, None) => return text,
    };

    let closer = if text[start..].starts_with('[') { ']' } else { '}' };
    let end = match json::matching_close(text, start) {
        Some(end) if text[end..].starts_with(closer) => Some(end),
        Some(_) => text[start..].rfind(closer).map(|i| start + i),
        None => {
            let report = json::check_balance(&text[start..]);
            if report.mismatched == 0 && report.stray == 0 {
                None
            } else {
                text[start..].rfind(closer).map(|i| start + i)
            }
        }
    };

    match end {
        Some(end) => &text[start..=end],
        None => &text[start..],
    }
}

// ============================================================================
// 测试模块
// ============================================================================
