//! XML 标签扫描与结构修复
//!
//! 扫描器按 `<` 切分文本，带引号跟踪地识别开始标签、结束标签、
//! 自闭合标签、注释 / CDATA / 处理指令，以及文本末尾被截断的构造。
//! 修复、平衡检查、续写结构分析共用同一个扫描器。

use super::continuation::Outline;
use super::dialect::BalanceReport;
use std::cmp::Reverse;

// ============================================================================
// 扫描器
// ============================================================================

/// 文本末尾被截断的构造
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Truncation {
    /// 开始标签（`<mxCell id="5" value="St`）
    Open,
    /// 结束标签（`</mxCe`）
    Close,
    /// 注释（`<!-- ...`）
    Comment,
    /// CDATA（`<![CDATA[ ...`）
    CData,
    /// 处理指令（`<?xml ...`）
    Instruction,
    /// 其他 `<!` 声明
    Declaration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind<'a> {
    /// 标签之间的文本
    Text,
    /// 开始标签或自闭合标签
    Open {
        name: &'a str,
        self_closing: bool,
        /// 标签内未闭合的引号（扫描回退到第一个 `>` 时出现）
        unbalanced_quote: Option<char>,
    },
    /// 结束标签；`terminated` 为 false 表示在 `>` 之前遇到了下一个 `<`
    Close { name: &'a str, terminated: bool },
    /// 注释、CDATA、处理指令、DOCTYPE
    Markup,
    /// 不能开始任何标签的 `<`
    Stray,
    /// 文本末尾被截断的构造
    Truncated(Truncation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub start: usize,
    pub end: usize,
}

pub(crate) struct Tokenizer<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn token(&mut self, kind: TokenKind<'a>, start: usize, end: usize) -> Token<'a> {
        self.pos = end;
        Token { kind, start, end }
    }

    /// 以固定终止符结束的构造（注释、CDATA、处理指令、声明）
    fn delimited(&mut self, start: usize, prefix: &str, terminator: &str, kind: Truncation) -> Token<'a> {
        let body = start + prefix.len();
        match self.text[body..].find(terminator) {
            Some(i) => self.token(TokenKind::Markup, start, body + i + terminator.len()),
            None => self.token(TokenKind::Truncated(kind), start, self.text.len()),
        }
    }

    fn close_tag(&mut self, start: usize) -> Token<'a> {
        let text = self.text;
        let name_start = start + 2;
        let name_end = scan_name(text, name_start);

        if name_end == name_start {
            if name_start >= text.len() {
                return self.token(TokenKind::Truncated(Truncation::Close), start, text.len());
            }
            return self.token(TokenKind::Stray, start, start + 1);
        }

        let name = &text[name_start..name_end];
        match text[name_end..].find(['>', '<']) {
            Some(i) if text[name_end + i..].starts_with('>') => self.token(
                TokenKind::Close {
                    name,
                    terminated: true,
                },
                start,
                name_end + i + 1,
            ),
            Some(i) => self.token(
                TokenKind::Close {
                    name,
                    terminated: false,
                },
                start,
                name_end + i,
            ),
            None => self.token(TokenKind::Truncated(Truncation::Close), start, text.len()),
        }
    }

    fn open_tag(&mut self, start: usize) -> Token<'a> {
        let text = self.text;
        let name_end = scan_name(text, start + 1);
        if name_end >= text.len() {
            return self.token(TokenKind::Truncated(Truncation::Open), start, text.len());
        }
        let name = &text[start + 1..name_end];

        let (terminator, quote) = find_tag_end(&text[name_end..]);
        if let Some(i) = terminator {
            let end = name_end + i + 1;
            let self_closing = text[name_end..end - 1].trim_end().ends_with('/');
            return self.token(
                TokenKind::Open {
                    name,
                    self_closing,
                    unbalanced_quote: None,
                },
                start,
                end,
            );
        }

        // 引号一直没有闭合：退回到第一个 `>` 作为标签结束
        if quote.is_some() {
            if let Some(i) = text[name_end..].find('>') {
                let end = name_end + i + 1;
                let inner = &text[name_end..end - 1];
                let (_, open_quote) = find_tag_end(inner);
                return self.token(
                    TokenKind::Open {
                        name,
                        self_closing: inner.trim_end().ends_with('/'),
                        unbalanced_quote: open_quote,
                    },
                    start,
                    end,
                );
            }
        }

        self.token(TokenKind::Truncated(Truncation::Open), start, text.len())
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let text = self.text;
        let start = self.pos;
        if start >= text.len() {
            return None;
        }

        let rest = &text[start..];
        if !rest.starts_with('<') {
            let end = rest.find('<').map(|i| start + i).unwrap_or(text.len());
            return Some(self.token(TokenKind::Text, start, end));
        }

        let token = if rest.starts_with("<!--") {
            self.delimited(start, "<!--", "-->", Truncation::Comment)
        } else if rest.starts_with("<![CDATA[") {
            self.delimited(start, "<![CDATA[", "]]>", Truncation::CData)
        } else if rest.starts_with("<?") {
            self.delimited(start, "<?", "?>", Truncation::Instruction)
        } else if rest.starts_with("<!") {
            self.delimited(start, "<!", ">", Truncation::Declaration)
        } else if rest.starts_with("</") {
            self.close_tag(start)
        } else if rest[1..].chars().next().map(is_name_start).unwrap_or(false) {
            self.open_tag(start)
        } else if rest.len() == 1 {
            self.token(TokenKind::Truncated(Truncation::Open), start, text.len())
        } else {
            self.token(TokenKind::Stray, start, start + 1)
        };
        Some(token)
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':' || (!c.is_ascii() && c.is_alphabetic())
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit() || c == '-' || c == '.'
}

/// 返回从 `from` 开始的名称结束位置
fn scan_name(text: &str, from: usize) -> usize {
    text[from..]
        .char_indices()
        .find(|(_, c)| !is_name_char(*c))
        .map(|(i, _)| from + i)
        .unwrap_or(text.len())
}

/// 带引号跟踪地查找标签结束的 `>`
///
/// 返回 `>` 的相对位置，以及扫描结束时仍未闭合的引号。
fn find_tag_end(body: &str) -> (Option<usize>, Option<char>) {
    let mut quote: Option<char> = None;
    for (i, c) in body.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '>' => return (Some(i), None),
                _ => {}
            },
        }
    }
    (None, quote)
}

// ============================================================================
// 修复
// ============================================================================

/// 修复 XML 结构
///
/// - 末尾仍未闭合的元素按 LIFO 顺序补齐结束标签
/// - 结束标签与栈顶不匹配时，先隐式闭合中间的元素；找不到对应开始标签的结束标签丢弃
/// - 结束标签名按开始标签的大小写重写
/// - 孤立的 `<` 转义为 `&lt;`
/// - 末尾截断的开始标签补全引号并自闭合；截断的结束标签丢弃
pub(crate) fn repair(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 64);
    let mut stack: Vec<&str> = Vec::new();

    for token in Tokenizer::new(text) {
        let slice = &text[token.start..token.end];
        match token.kind {
            TokenKind::Text | TokenKind::Markup => out.push_str(slice),
            TokenKind::Stray => out.push_str("&lt;"),
            TokenKind::Open {
                name,
                self_closing,
                unbalanced_quote,
            } => {
                match unbalanced_quote {
                    Some(quote) => out.push_str(&close_quote(slice, quote, self_closing)),
                    None => out.push_str(slice),
                }
                if !self_closing {
                    stack.push(name);
                }
            }
            TokenKind::Close { name, terminated } => {
                let Some(idx) = stack.iter().rposition(|open| open.eq_ignore_ascii_case(name)) else {
                    continue;
                };
                while stack.len() > idx + 1 {
                    if let Some(inner) = stack.pop() {
                        push_closer(&mut out, inner);
                    }
                }
                if let Some(open) = stack.pop() {
                    if terminated && open == name {
                        out.push_str(slice);
                    } else {
                        push_closer(&mut out, open);
                    }
                }
            }
            TokenKind::Truncated(kind) => match kind {
                Truncation::Open => {
                    if let Some(fixed) = complete_open_fragment(slice) {
                        out.push_str(&fixed);
                    }
                }
                Truncation::Comment => {
                    out.push_str(slice);
                    out.push_str("-->");
                }
                Truncation::CData => {
                    out.push_str(slice);
                    out.push_str("]]>");
                }
                Truncation::Instruction => {
                    out.push_str(slice);
                    out.push_str("?>");
                }
                Truncation::Close | Truncation::Declaration => {}
            },
        }
    }

    while let Some(name) = stack.pop() {
        push_closer(&mut out, name);
    }
    out
}


fn push_closer(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

/// 在标签结尾的 `>` / `/>` 前补上缺失的引号
fn close_quote(tag: &str, quote: char, self_closing: bool) -> String {
    let body = tag.strip_suffix('>').unwrap_or(tag);
    let (body, tail) = if self_closing {
        match body.rfind('/') {
            Some(i) => (&body[..i], "/>"),
            None => (body, ">"),
        }
    } else {
        (body, ">")
    };
    format!("{}{}{}", body, quote, tail)
}

/// 补全文本末尾被截断的开始标签
///
/// 名称本身可能不完整时返回 `None`（整段丢弃）。否则闭合未结束的引号，
/// 去掉最后一个完整属性值之后的残缺属性，再以 `/>` 结束。
fn complete_open_fragment(fragment: &str) -> Option<String> {
    let name_end = scan_name(fragment, 1);
    if name_end <= 1 || name_end >= fragment.len() {
        return None;
    }

    let mut quote: Option<char> = None;
    let mut last_value_end = name_end;
    for (i, c) in fragment[name_end..].char_indices() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                last_value_end = name_end + i + 1;
            }
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None => {}
        }
    }

    let mut fixed = match quote {
        Some(q) => format!("{}{}", fragment, q),
        None => {
            if fragment[last_value_end..].trim() == "/" {
                fragment.to_string()
            } else {
                fragment[..last_value_end].to_string()
            }
        }
    };

    let trimmed_len = fixed.trim_end().len();
    fixed.truncate(trimmed_len);
    if fixed.ends_with('/') {
        fixed.push('>');
    } else {
        fixed.push_str("/>");
    }
    Some(fixed)
}

// ============================================================================
// 平衡检查
// ============================================================================

/// 栈式平衡检查；结束标签名必须与开始标签完全一致
pub(crate) fn check_balance(text: &str) -> BalanceReport {
    let mut report = BalanceReport::default();
    let mut stack: Vec<&str> = Vec::new();

    for token in Tokenizer::new(text) {
        match token.kind {
            TokenKind::Text | TokenKind::Markup => {}
            TokenKind::Stray => report.stray += 1,
            TokenKind::Truncated(_) => report.malformed += 1,
            TokenKind::Open {
                name,
                self_closing,
                unbalanced_quote,
            } => {
                if unbalanced_quote.is_some() {
                    report.malformed += 1;
                }
                if !self_closing {
                    stack.push(name);
                }
            }
            TokenKind::Close { name, terminated } => {
                if !terminated {
                    report.malformed += 1;
                }
                if stack.last() == Some(&name) {
                    stack.pop();
                } else if let Some(idx) =
                    stack.iter().rposition(|open| open.eq_ignore_ascii_case(name))
                {
                    report.mismatched += 1;
                    stack.truncate(idx);
                } else {
                    report.stray += 1;
                }
            }
        }
    }

    report.unclosed = stack.iter().rev().map(|name| format!("</{}>", name)).collect();
    report
}

// ============================================================================
// 续写结构分析
// ============================================================================

type Spans = Vec<(usize, usize)>;

/// draw.io 中本身就是结构单元的元素
const UNIT_TAGS: [&str; 3] = ["mxCell", "UserObject", "object"];

fn is_unit_tag(name: &str) -> bool {
    UNIT_TAGS.iter().any(|tag| tag.eq_ignore_ascii_case(name))
}

struct Frame<'a> {
    name: &'a str,
    start: usize,
    depth: usize,
    children: Spans,
    child_names: Vec<&'a str>,
    /// 最近一个闭合的直接子元素的子元素
    last_child: Option<Spans>,
}

impl<'a> Frame<'a> {
    fn push_child(&mut self, name: &'a str, span: (usize, usize)) {
        self.children.push(span);
        self.child_names.push(name);
    }

    fn has_child_named(&self, name: &str) -> bool {
        self.child_names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    fn unit_children(&self) -> usize {
        self.child_names.iter().filter(|n| is_unit_tag(n)).count()
    }
}

/// 分析文本的开放元素与完整子元素
///
/// 最外层开放的 draw.io 单元（`mxCell` 等），或父元素中已有同名完整兄弟的最内层元素，
/// 是正在书写的单元，结构单元取自它的父元素（通常是 `root`）。
/// 没有这类元素时取最内层的开放元素；`</root>` 已出现但 `</mxGraphModel>` 缺失时，
/// 改取它最近闭合的子元素的子元素。文档已完整时取包含最多单元子元素的已闭合元素。
pub(crate) fn outline(text: &str) -> Outline {
    let mut stack: Vec<Frame> = Vec::new();
    let mut document: Spans = Vec::new();
    let mut closed: Vec<Frame> = Vec::new();

    for token in Tokenizer::new(text) {
        match token.kind {
            TokenKind::Open {
                name,
                self_closing: true,
                ..
            } => match stack.last_mut() {
                Some(parent) => parent.push_child(name, (token.start, token.end)),
                None => document.push((token.start, token.end)),
            },
            TokenKind::Open { name, .. } => {
                let depth = stack.len() + 1;
                stack.push(Frame {
                    name,
                    start: token.start,
                    depth,
                    children: Vec::new(),
                    child_names: Vec::new(),
                    last_child: None,
                });
            }
            TokenKind::Close { name, .. } => {
                let Some(idx) = stack.iter().rposition(|open| open.name.eq_ignore_ascii_case(name)) else {
                    continue;
                };
                while stack.len() > idx {
                    let Some(frame) = stack.pop() else { break };
                    let end = if stack.len() == idx { token.end } else { token.start };
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.push_child(frame.name, (frame.start, end));
                            parent.last_child = Some(frame.children.clone());
                        }
                        None => document.push((frame.start, end)),
                    }
                    closed.push(frame);
                }
            }
            _ => {}
        }
    }

    let closers = stack.iter().rev().map(|f| format!("</{}>", f.name)).collect();

    let units = if stack.is_empty() {
        closed
            .into_iter()
            .map(|f| (f.unit_children(), f.children.len(), Reverse(f.depth), f.children))
            .chain(std::iter::once((0, document.len(), Reverse(0), document)))
            .max_by_key(|(units, len, depth, _)| (*units, *len, *depth))
            .map(|(_, _, _, children)| children)
            .unwrap_or_default()
    } else {
        let in_progress = (1..stack.len())
            .find(|&i| is_unit_tag(stack[i].name))
            .or_else(|| {
                let top = stack.len() - 1;
                (top > 0 && stack[top - 1].has_child_named(stack[top].name)).then_some(top)
            });
        match in_progress {
            Some(i) => stack.swap_remove(i - 1).children,
            None => match stack.pop() {
                Some(top) => match top.last_child {
                    Some(nested) if nested.len() > top.children.len() => nested,
                    _ => top.children,
                },
                None => Vec::new(),
            },
        }
    };

    Outline {
        closers,
        units,
        in_string: false,
    }
}

// ============================================================================
// 测试模块
// ============================================================================
