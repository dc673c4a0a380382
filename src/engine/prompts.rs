//! 默认提示词
//!
//! 调用方可以通过 [`crate::TurnConfig::system_prompt_override`] 覆盖系统提示词，
//! 或者实现自己的 [`PromptBuilder`]。

use crate::markup::{ContinuationContext, Dialect};

use super::collaborators::PromptBuilder;

const DRAWIO_SYSTEM_PROMPT: &str = r#"你是一名 draw.io 图表专家，根据用户需求生成 mxGraph XML。

输出要求：
1. 只输出 XML 代码，从 <mxfile> 开始，到 </mxfile> 结束，不要输出任何解释文字
2. 结构固定为 <mxfile><diagram><mxGraphModel><root>...</root></mxGraphModel></diagram></mxfile>
3. root 中必须先有 <mxCell id="0"/> 与 <mxCell id="1" parent="0"/>，其余元素 id 从 2 开始递增
4. 标签名严格区分大小写：mxCell、mxGraphModel、mxGeometry
5. 属性值中的特殊字符必须转义（&amp; &lt; &gt; &quot;）
6. 坐标与尺寸使用 10 的倍数，保持对齐，连线不要穿过节点"#;

const EXCALIDRAW_SYSTEM_PROMPT: &str = r#"你是一名 Excalidraw 图表专家，根据用户需求生成 Excalidraw 元素。

输出要求：
1. 只输出 JSON，不要输出任何解释文字
2. 顶层为元素数组 [...]，每个元素包含 id、type、x、y、width、height 等字段
3. type 只能是 rectangle、ellipse、diamond、arrow、line、text
4. 箭头通过 startBinding / endBinding 引用节点 id
5. 文本元素使用 text 字段，字号使用 fontSize
6. 元素之间保持一致的间距，避免重叠"#;

const DRAWIO_CONTINUATION_SYSTEM_PROMPT: &str = r#"你是一名 draw.io 图表专家。之前生成的 XML 因长度限制被截断，你需要从截断处继续输出剩余部分。

规则：
1. 只输出续写部分，不要重复任何已经生成的内容
2. 不要重新输出 <?xml>、<mxfile>、<diagram>、<mxGraphModel>、<root> 等已存在的开始标签
3. 如果最后一个 mxCell 没有闭合，先把它补全
4. 新元素的 id 从给定的编号开始递增
5. 最后按顺序输出所有缺失的闭合标签
6. 不要输出解释文字或 markdown 标记"#;

const EXCALIDRAW_CONTINUATION_SYSTEM_PROMPT: &str = r#"你是一名 Excalidraw 图表专家。之前生成的 JSON 因长度限制被截断，你需要从截断处继续输出剩余部分。

规则：
1. 只输出续写部分，不要重复任何已经生成的内容
2. 如果最后一个元素没有写完，从截断的位置接着写完它
3. 保持与已有元素一致的字段与风格
4. 最后按顺序输出所有缺失的闭合符
5. 不要输出解释文字或 markdown 标记"#;

/// 图表类型的显示名称
fn chart_type_label(chart_type: &str) -> &str {
    match chart_type {
        "auto" | "" => "自动",
        "flowchart" => "流程图",
        "mindmap" => "思维导图",
        "orgchart" => "组织架构图",
        "sequence" => "时序图",
        "class" => "类图",
        "er" => "ER 图",
        "gantt" => "甘特图",
        "timeline" => "时间线",
        "tree" => "树形图",
        "network" => "网络拓扑图",
        "architecture" => "架构图",
        "state" => "状态图",
        "swimlane" => "泳道图",
        other => other,
    }
}

/// 默认提示词实现
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPrompts;

impl PromptBuilder for DefaultPrompts {
    fn system_prompt(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Xml => DRAWIO_SYSTEM_PROMPT.to_string(),
            Dialect::Json => EXCALIDRAW_SYSTEM_PROMPT.to_string(),
        }
    }

    fn user_prompt(&self, _dialect: Dialect, input: &str, chart_type: &str) -> String {
        format!(
            "用户需求：\n\"{}\"\n\n图表类型：\"{}\"",
            input,
            chart_type_label(chart_type)
        )
    }

    fn continuation_system_prompt(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Xml => DRAWIO_CONTINUATION_SYSTEM_PROMPT.to_string(),
            Dialect::Json => EXCALIDRAW_CONTINUATION_SYSTEM_PROMPT.to_string(),
        }
    }

    fn continuation_prompt(&self, context: &ContinuationContext) -> String {
        let dialect = context.dialect;
        let mut code = context.trailing_units.join("\n");
        if !context.incomplete_tail.is_empty() {
            if !code.is_empty() {
                code.push('\n');
            }
            code.push_str(&context.incomplete_tail);
        }

        let closers = if context.missing_closers.is_empty() {
            "无".to_string()
        } else {
            context.missing_closers.join(" → ")
        };

        let id_line = match dialect {
            Dialect::Xml => format!(
                "- 当前最大 id：{}（续写时从 {} 开始）",
                context.max_id(),
                context.next_id
            ),
            Dialect::Json => format!("- 新元素的数字 id 从 {} 开始", context.next_id),
        };

        format!(
            "## 已生成的代码（最后部分）\n\n```{tag}\n...\n{code}\n```\n\n\
             ## 当前状态\n{id_line}\n- 缺失的闭合符：{closers}\n\n\
             ## 任务\n上面的代码被截断了，请只输出剩余的代码：\n\
             1. 如果最后一个元素没有闭合，先补全它\n\
             2. 继续生成后续元素，不要重复已有内容\n\
             3. 最后依次输出缺失的闭合符：{closers}\n\
             4. 不要输出解释文字或 markdown 标记",
            tag = dialect.fence_tag(),
            code = code,
            id_line = id_line,
            closers = closers,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markup::build_context;

    #[test]
    fn test_user_prompt_chart_label() {
        let prompts = DefaultPrompts;
        let prompt = prompts.user_prompt(Dialect::Xml, "登录流程", "flowchart");
        assert!(prompt.contains("\"登录流程\""));
        assert!(prompt.contains("流程图"));
        assert!(prompts
            .user_prompt(Dialect::Json, "x", "custom-kind")
            .contains("custom-kind"));
    }

    #[test]
    fn test_system_prompts_per_dialect() {
        let prompts = DefaultPrompts;
        assert!(prompts.system_prompt(Dialect::Xml).contains("mxGraph"));
        assert!(prompts.system_prompt(Dialect::Json).contains("Excalidraw"));
        assert!(prompts
            .continuation_system_prompt(Dialect::Xml)
            .contains("截断"));
    }

    #[test]
    fn test_continuation_prompt_renders_context() {
        let text = r#"<mxfile><diagram><mxGraphModel><root><mxCell id="0"/><mxCell id="1" parent="0"/><mxCell id="5" value="Start""#;
        let context = build_context(text, Dialect::Xml, 3);
        let prompt = DefaultPrompts.continuation_prompt(&context);

        assert!(prompt.contains("```xml"));
        assert!(prompt.contains(r#"<mxCell id="1" parent="0"/>"#));
        assert!(prompt.contains(r#"<mxCell id="5" value="Start""#));
        assert!(prompt.contains("当前最大 id：5（续写时从 6 开始）"));
        assert!(prompt.contains("</root> → </mxGraphModel> → </diagram> → </mxfile>"));
    }

    #[test]
    fn test_continuation_prompt_json() {
        let text = r#"[{"id":"a","type":"rectangle"},{"id":"b","type":"text"#;
        let context = build_context(text, Dialect::Json, 3);
        let prompt = DefaultPrompts.continuation_prompt(&context);
        assert!(prompt.contains("```json"));
        assert!(prompt.contains(r#"{"id":"b","type":"text"#));
        assert!(prompt.contains("\" → } → ]"));
    }
}
