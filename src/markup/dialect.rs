//! 标记方言
//!
//! 每个引擎实例固定一种方言（draw.io ⇒ XML，Excalidraw ⇒ JSON），
//! 提取、修复、续写都按方言选择对应的规则，生成过程中不做推断。

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{json, xml};

/// 标记方言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// draw.io mxGraph XML
    Xml,
    /// Excalidraw JSON
    Json,
}

impl Dialect {
    /// 代码块围栏上的语言标记
    pub fn fence_tag(&self) -> &'static str {
        match self {
            Dialect::Xml => "xml",
            Dialect::Json => "json",
        }
    }

    /// 历史记录中使用的引擎标签
    pub fn history_tag(&self) -> &'static str {
        match self {
            Dialect::Xml => "drawio",
            Dialect::Json => "excalidraw",
        }
    }

    /// 续写结果拼接到已有内容时使用的连接符
    pub fn joiner(&self) -> &'static str {
        match self {
            Dialect::Xml => "\n",
            Dialect::Json => "",
        }
    }

    /// 未找到任何数字 id 时使用的最大 id
    ///
    /// draw.io 的 `0` 与 `1` 两个单元固定存在，新元素从 `3` 开始。
    pub(crate) fn implicit_max_id(&self) -> Option<u64> {
        match self {
            Dialect::Xml => Some(2),
            Dialect::Json => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Xml => write!(f, "xml"),
            Dialect::Json => write!(f, "json"),
        }
    }
}

// ============================================================================
// 结构平衡检查
// ============================================================================

/// 栈式平衡检查结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceReport {
    /// 未闭合的结构，按内层在前排列的闭合符
    pub unclosed: Vec<String>,
    /// 与栈顶不匹配、但能在栈中找到对应开启的闭合符数量
    pub mismatched: usize,
    /// 没有对应开启的闭合符或孤立的 `<`
    pub stray: usize,
    /// 被截断或引号不完整的标签、注释等
    pub malformed: usize,
    /// JSON 字符串未闭合
    pub unterminated_string: bool,
}

impl BalanceReport {
    /// 是否完全平衡
    pub fn is_balanced(&self) -> bool {
        self.unclosed.is_empty()
            && self.mismatched == 0
            && self.stray == 0
            && self.malformed == 0
            && !self.unterminated_string
    }
}

/// 对文本做栈式平衡检查
pub fn check_balance(text: &str, dialect: Dialect) -> BalanceReport {
    match dialect {
        Dialect::Xml => xml::check_balance(text),
        Dialect::Json => json::check_balance(text),
    }
}

/// 文本在方言语法下是否结构完整
///
/// 只检查嵌套平衡，不校验 draw.io / Excalidraw 的领域约束。
pub fn is_well_formed(text: &str, dialect: Dialect) -> bool {
    check_balance(text, dialect).is_balanced()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_tags() {
        assert_eq!(Dialect::Xml.fence_tag(), "xml");
        assert_eq!(Dialect::Json.fence_tag(), "json");
        assert_eq!(Dialect::Xml.history_tag(), "drawio");
        assert_eq!(Dialect::Json.history_tag(), "excalidraw");
        assert_eq!(Dialect::Xml.joiner(), "\n");
        assert_eq!(Dialect::Json.joiner(), "");
    }

    #[test]
    fn test_dialect_serde() {
        assert_eq!(serde_json::to_string(&Dialect::Xml).unwrap(), "\"xml\"");
        let d: Dialect = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(d, Dialect::Json);
    }

    #[test]
    fn test_is_well_formed() {
        assert!(is_well_formed("<a><b/></a>", Dialect::Xml));
        assert!(!is_well_formed("<a><b>", Dialect::Xml));
        assert!(is_well_formed(r#"[{"a":"]"}]"#, Dialect::Json));
        assert!(!is_well_formed(r#"[{"a":1}"#, Dialect::Json));
    }
}
