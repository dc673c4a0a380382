//! 标记处理模块
//!
//! 对模型输出做提取、结构修复与续写上下文构建，支持两种方言：
//! - draw.io mxGraph XML
//! - Excalidraw JSON
//!
//! 本模块中的函数都是纯函数，不持有状态，可在多个引擎间并发调用。

pub mod continuation;
pub mod dialect;
pub mod extract;
pub mod json;
pub mod payload;
pub mod xml;

pub use continuation::{
    build_context, is_truncated, missing_closers, next_id, ContinuationContext,
};
pub use dialect::{check_balance, is_well_formed, BalanceReport, Dialect};
pub use extract::{extract, strip_fences};
pub use json::parse_elements;
pub use payload::{ExtractedPayload, RepairedPayload};

use regex::Regex;
use tracing::{debug, warn};

/// 结构修复
///
/// 补全未闭合的标签 / 括号 / 引号，输出在对应方言下总是结构平衡的。
/// 已平衡的输入原样返回。
pub fn repair(input: impl AsRef<str>, dialect: Dialect) -> RepairedPayload {
    let input = input.as_ref();
    let repaired = match dialect {
        Dialect::Xml => xml::repair(input),
        Dialect::Json => json::repair(input),
    };

    if repaired.len() != input.len() {
        debug!(
            dialect = %dialect,
            input_len = input.len(),
            repaired_len = repaired.len(),
            "已修复标记结构"
        );
    }
    RepairedPayload::new(repaired)
}

/// 编译静态正则，失败时记录日志并返回 None
pub(crate) fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(pattern = pattern, error = %e, "正则表达式编译失败");
            None
        }
    }
}
