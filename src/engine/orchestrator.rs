//! 生成编排
//!
//! [`DiagramEngine`] 按轮次串联各组件：
//!
//! 1. 发起请求，字节流经 [`decode_stream_with_metrics`] 解码为事件，同时记录流式指标
//! 2. `delta` 事件写入 [`ContentAccumulator`]，驱动实时预览
//! 3. 流结束后对冻结的内容提取、修复一次，应用到画布并写入历史记录
//! 4. 结果被截断时，由调用方显式触发续写，续写结果拼接到上一次的提取结果之后
//!
//! 每个引擎实例同一时间只允许一轮生成；会话状态由 `parking_lot::Mutex`
//! 保护，锁不会跨越 `.await` 持有。

use crate::config::{EngineConfig, LlmConfig, TurnConfig};
use crate::markup::{
    build_context, extract, missing_closers, repair, strip_fences, Dialect, ExtractedPayload,
    RepairedPayload,
};
use crate::models::{build_user_message, Attachment, ChatMessage, MessageRole};
use crate::streaming::{
    decode_stream_with_metrics, ContentAccumulator, EventStream, LlmClient, StreamError,
    StreamEvent,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::collaborators::{CanvasApplier, HistoryEntry, HistoryStore, PromptBuilder};
use super::error::EngineError;
use super::prompts::DefaultPrompts;
use super::state::TurnState;
use super::turn::{ConversationTurn, TurnKind, TurnOutcome};

/// 实时预览回调
pub type PreviewListener = Arc<dyn Fn(&str) + Send + Sync>;

/// 错误提示前缀
const ERROR_NOTICE: &str = "❌ 错误";
const CONTINUATION_ERROR_NOTICE: &str = "❌ 继续生成失败";

// ============================================================================
// 会话状态
// ============================================================================

/// 最近一次应用的结果（续写的基础）
#[derive(Debug, Clone)]
struct AppliedPayload {
    extracted: ExtractedPayload,
    truncated: bool,
}

#[derive(Debug)]
struct Session {
    conversation_id: String,
    messages: Vec<ChatMessage>,
    used_code: String,
    state: TurnState,
    applied: Option<AppliedPayload>,
    last_turn: Option<ConversationTurn>,
}

impl Session {
    fn new(conversation_id: String) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            used_code: String::new(),
            state: TurnState::Idle,
            applied: None,
            last_turn: None,
        }
    }
}

fn new_conversation_id() -> String {
    Uuid::new_v4().to_string()
}

/// 生成中标志的 RAII 守卫
struct GenerationGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> GenerationGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 流式读取结果
struct StreamedText {
    content: String,
    saw_sentinel: bool,
}

// ============================================================================
// 引擎
// ============================================================================

/// 图表生成引擎
///
/// 一个实例对应一块画布和一种方言。
pub struct DiagramEngine {
    dialect: Dialect,
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    canvas: Arc<dyn CanvasApplier>,
    history: Arc<dyn HistoryStore>,
    prompts: Arc<dyn PromptBuilder>,
    generating: AtomicBool,
    session: Mutex<Session>,
    listener: Mutex<Option<PreviewListener>>,
}

impl DiagramEngine {
    /// 创建引擎，使用默认提示词
    pub fn new(
        dialect: Dialect,
        config: EngineConfig,
        llm: Arc<dyn LlmClient>,
        canvas: Arc<dyn CanvasApplier>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        info!(
            dialect = %dialect,
            client = llm.client_name(),
            "创建图表生成引擎"
        );
        Self {
            dialect,
            config,
            llm,
            canvas,
            history,
            prompts: Arc::new(DefaultPrompts),
            generating: AtomicBool::new(false),
            session: Mutex::new(Session::new(new_conversation_id())),
            listener: Mutex::new(None),
        }
    }

    /// 替换提示词构建器
    pub fn with_prompts(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> TurnState {
        self.session.lock().state
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }

    pub fn conversation_id(&self) -> String {
        self.session.lock().conversation_id.clone()
    }

    /// 对话记录快照
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.session.lock().messages.clone()
    }

    /// 当前画布使用的代码
    pub fn used_code(&self) -> String {
        self.session.lock().used_code.clone()
    }

    /// 最近一轮的记录快照（失败时含部分内容）
    pub fn last_turn(&self) -> Option<ConversationTurn> {
        self.session.lock().last_turn.clone()
    }

    /// 最近一次应用的结果是否被截断
    pub fn can_continue(&self) -> bool {
        self.session
            .lock()
            .applied
            .as_ref()
            .map(|applied| applied.truncated)
            .unwrap_or(false)
    }

    /// 设置实时预览回调，每个 `delta` 事件触发一次
    pub fn set_update_listener<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.listener.lock() = Some(Arc::new(listener));
    }

    pub fn clear_update_listener(&self) {
        *self.listener.lock() = None;
    }

    // ------------------------------------------------------------------------
    // 生成
    // ------------------------------------------------------------------------

    /// 发送用户消息并生成图表
    pub async fn send_message(
        &self,
        input: &str,
        attachments: &[Attachment],
        turn_config: &TurnConfig,
    ) -> Result<TurnOutcome, EngineError> {
        let _guard = GenerationGuard::acquire(&self.generating).ok_or(EngineError::AlreadyGenerating)?;

        let trimmed = input.trim();
        if trimmed.is_empty() && attachments.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        self.validate_llm(&turn_config.llm)?;

        let system_prompt = self.prompts.system_prompt(self.dialect);
        let system = ChatMessage::system(turn_config.system_prompt(&system_prompt));
        let user_content = self
            .prompts
            .user_prompt(self.dialect, trimmed, &turn_config.chart_type);
        let user_message = build_user_message(&user_content, attachments);

        let (conversation_id, messages, mut turn) = {
            let mut session = self.session.lock();
            let history: Vec<ChatMessage> = session
                .messages
                .iter()
                .filter(|m| m.is_history_candidate())
                .cloned()
                .collect();
            let skip = history.len().saturating_sub(self.config.history_limit);

            let mut messages = Vec::with_capacity(history.len() - skip + 2);
            messages.push(system);
            messages.extend(history.into_iter().skip(skip));
            messages.push(user_message.clone());

            session.messages.push(user_message.clone());
            Self::transition(&mut session, TurnState::Requesting);
            let turn = ConversationTurn::new(&session.conversation_id, TurnKind::Generate, trimmed);
            (session.conversation_id.clone(), messages, turn)
        };

        info!(
            turn_id = %turn.id,
            conversation_id = %conversation_id,
            dialect = %self.dialect,
            chart_type = %turn_config.chart_type,
            message_count = messages.len(),
            "开始生成"
        );

        let wire_config = turn_config.llm.for_request(self.config.password_mode());
        self.record_history(&conversation_id, user_message, &wire_config, &turn_config.chart_type)
            .await;

        let streamed = match self.stream_turn(&mut turn, &turn_config.llm, &messages).await {
            Ok(streamed) => streamed,
            Err(e) => return Err(self.fail_turn(turn, e, ERROR_NOTICE)),
        };

        // Finalizing：只在流结束后提取、修复一次
        self.set_state(TurnState::Finalizing);
        let (extracted, repaired) = self.finalize(&mut turn, &streamed.content, streamed.saw_sentinel);

        let assistant = ChatMessage::assistant(repaired.as_str());
        self.session.lock().messages.push(assistant.clone());
        self.record_history(&conversation_id, assistant, &wire_config, &turn_config.chart_type)
            .await;

        self.apply_to_canvas(&conversation_id, &repaired).await;
        Ok(self.complete_turn(turn, extracted, repaired))
    }

    /// 续写被截断的结果
    ///
    /// 续写失败时保留之前已应用的结果。
    pub async fn continue_generation(
        &self,
        turn_config: &TurnConfig,
    ) -> Result<TurnOutcome, EngineError> {
        let _guard = GenerationGuard::acquire(&self.generating).ok_or(EngineError::AlreadyGenerating)?;

        let prior = {
            let session = self.session.lock();
            match &session.applied {
                Some(applied) if applied.truncated && !applied.extracted.is_empty() => {
                    applied.extracted.clone()
                }
                _ => return Err(EngineError::NothingToContinue),
            }
        };
        self.validate_llm(&turn_config.llm)?;

        let context = build_context(prior.as_str(), self.dialect, self.config.continuation_units);
        let prompt = self.prompts.continuation_prompt(&context);
        let messages = vec![
            ChatMessage::system(self.prompts.continuation_system_prompt(self.dialect)),
            ChatMessage::user(prompt.as_str()),
        ];

        let (conversation_id, mut turn) = {
            let mut session = self.session.lock();
            Self::transition(&mut session, TurnState::Requesting);
            let turn = ConversationTurn::new(&session.conversation_id, TurnKind::Continuation, prompt);
            (session.conversation_id.clone(), turn)
        };

        info!(
            turn_id = %turn.id,
            conversation_id = %conversation_id,
            dialect = %self.dialect,
            next_id = context.next_id,
            missing_closers = ?context.missing_closers,
            trailing_units = context.trailing_units.len(),
            "开始续写"
        );

        let streamed = match self.stream_turn(&mut turn, &turn_config.llm, &messages).await {
            Ok(streamed) => streamed,
            Err(e) => return Err(self.fail_turn(turn, e, CONTINUATION_ERROR_NOTICE)),
        };

        self.set_state(TurnState::Finalizing);
        let continued = strip_fences(&streamed.content);
        let combined = format!("{}{}{}", prior, self.dialect.joiner(), continued);
        let (extracted, repaired) = self.finalize(&mut turn, &combined, streamed.saw_sentinel);

        {
            let mut session = self.session.lock();
            match session
                .messages
                .iter_mut()
                .rev()
                .find(|m| m.role == MessageRole::Assistant)
            {
                Some(message) => *message = ChatMessage::assistant(repaired.as_str()),
                None => session.messages.push(ChatMessage::assistant(repaired.as_str())),
            }
        }

        self.apply_to_canvas(&conversation_id, &repaired).await;
        Ok(self.complete_turn(turn, extracted, repaired))
    }

    // ------------------------------------------------------------------------
    // 会话操作
    // ------------------------------------------------------------------------

    /// 新建对话
    pub fn new_chat(&self) -> Result<String, EngineError> {
        let _guard = GenerationGuard::acquire(&self.generating).ok_or(EngineError::AlreadyGenerating)?;
        let conversation_id = new_conversation_id();
        *self.session.lock() = Session::new(conversation_id.clone());
        info!(conversation_id = %conversation_id, "新建对话");
        Ok(conversation_id)
    }

    /// 恢复历史对话，并重新应用其代码
    pub async fn restore(
        &self,
        conversation_id: &str,
        messages: Vec<ChatMessage>,
        used_code: &str,
    ) -> Result<RepairedPayload, EngineError> {
        let _guard = GenerationGuard::acquire(&self.generating).ok_or(EngineError::AlreadyGenerating)?;
        {
            let mut session = self.session.lock();
            *session = Session::new(conversation_id.to_string());
            session.messages = messages;
        }
        info!(conversation_id = %conversation_id, "恢复历史对话");
        Ok(self.apply_code(used_code).await)
    }

    /// 手动应用代码：提取、修复后应用到画布
    pub async fn apply_code(&self, code: &str) -> RepairedPayload {
        let (extracted, repaired) = self.prepare_code(code);
        let conversation_id = self.conversation_id();
        self.remember_applied(extracted, &repaired);
        self.apply_to_canvas(&conversation_id, &repaired).await;
        repaired
    }

    /// 画布被用户编辑：修复并记录，不再回写画布
    pub async fn canvas_changed(&self, code: &str) -> RepairedPayload {
        let (extracted, repaired) = self.prepare_code(code);
        let conversation_id = self.conversation_id();
        self.remember_applied(extracted, &repaired);
        self.update_used_code(&conversation_id, &repaired).await;
        repaired
    }

    // ------------------------------------------------------------------------
    // 内部实现
    // ------------------------------------------------------------------------

    fn validate_llm(&self, llm: &LlmConfig) -> Result<(), EngineError> {
        if llm.is_valid_for(self.config.password_mode()) {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig("请先配置 LLM".to_string()))
        }
    }

    fn transition(session: &mut Session, next: TurnState) {
        if !session.state.can_transition_to(next) {
            warn!(from = %session.state, to = %next, "非预期的状态转换");
        }
        debug!(from = %session.state, to = %next, "状态转换");
        session.state = next;
    }

    fn set_state(&self, next: TurnState) {
        Self::transition(&mut self.session.lock(), next);
    }

    fn new_accumulator(&self) -> ContentAccumulator {
        match self.listener.lock().clone() {
            Some(listener) => ContentAccumulator::with_listener(move |content| listener(content)),
            None => ContentAccumulator::new(),
        }
    }

    /// 发起请求并读取整个流
    async fn stream_turn(
        &self,
        turn: &mut ConversationTurn,
        llm: &LlmConfig,
        messages: &[ChatMessage],
    ) -> Result<StreamedText, EngineError> {
        let source = self
            .llm
            .stream_chat(llm, messages)
            .await
            .map_err(|e| EngineError::stream(e, ""))?;

        self.set_state(TurnState::Streaming);
        turn.state = TurnState::Streaming;

        let metrics = Arc::new(Mutex::new(turn.metrics.clone()));
        let mut events = decode_stream_with_metrics(source, &self.config.stream, metrics.clone());
        let mut accumulator = self.new_accumulator();
        let result = Self::drain_events(&mut events, &mut accumulator).await;
        drop(events);

        turn.metrics = metrics.lock().clone();
        turn.metrics.finish();
        turn.buffer = accumulator.into_buffer();

        match result {
            Err(e) => Err(EngineError::stream(e, turn.buffer.clone())),
            // 没有任何内容、也没有正常结束标记
            Ok(false) if turn.buffer.is_empty() => Err(EngineError::stream(
                StreamError::network("流在产生内容前中断"),
                "",
            )),
            Ok(saw_sentinel) => {
                turn.saw_sentinel = saw_sentinel;
                Ok(StreamedText {
                    content: turn.buffer.clone(),
                    saw_sentinel,
                })
            }
        }
    }

    /// 把事件写入累积缓冲区，返回是否收到过 `[DONE]`
    async fn drain_events(
        events: &mut EventStream,
        accumulator: &mut ContentAccumulator,
    ) -> Result<bool, StreamError> {
        let mut saw_sentinel = false;
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    accumulator.freeze();
                    return Err(e);
                }
            };
            match &event {
                StreamEvent::Error { message } => {
                    accumulator.freeze();
                    return Err(StreamError::upstream(message.clone()));
                }
                StreamEvent::Done { sentinel } => saw_sentinel = *sentinel,
                StreamEvent::Delta { .. } => {}
            }
            accumulator.apply(&event);
        }
        accumulator.freeze();
        Ok(saw_sentinel)
    }

    /// 提取、修复，并记录截断状态
    fn finalize(
        &self,
        turn: &mut ConversationTurn,
        content: &str,
        saw_sentinel: bool,
    ) -> (ExtractedPayload, RepairedPayload) {
        turn.state = TurnState::Finalizing;
        let extracted = extract(content, self.dialect);
        let missing = missing_closers(extracted.as_str(), self.dialect);
        let repaired = repair(&extracted, self.dialect);

        turn.truncated = !missing.is_empty() || !saw_sentinel;
        turn.missing_closers = missing;
        debug!(
            turn_id = %turn.id,
            extracted_len = extracted.len(),
            repaired_len = repaired.len(),
            truncated = turn.truncated,
            saw_sentinel = saw_sentinel,
            "生成结果已修复"
        );
        (extracted, repaired)
    }

    fn complete_turn(
        &self,
        mut turn: ConversationTurn,
        extracted: ExtractedPayload,
        repaired: RepairedPayload,
    ) -> TurnOutcome {
        turn.state = TurnState::Applied;
        turn.extracted = Some(extracted.clone());
        turn.repaired = Some(repaired.clone());
        turn.metrics.log_metrics(&turn.id);

        info!(
            turn_id = %turn.id,
            kind = ?turn.kind,
            truncated = turn.truncated,
            missing_closers = ?turn.missing_closers,
            "生成完成"
        );

        let outcome = TurnOutcome {
            turn_id: turn.id.clone(),
            kind: turn.kind,
            extracted: extracted.clone(),
            repaired,
            missing_closers: turn.missing_closers.clone(),
            truncated: turn.truncated,
            metrics: turn.metrics.clone(),
        };

        let mut session = self.session.lock();
        session.applied = Some(AppliedPayload {
            extracted,
            truncated: turn.truncated,
        });
        Self::transition(&mut session, TurnState::Applied);
        session.last_turn = Some(turn);
        outcome
    }

    /// 本轮失败：记录错误提示，保留之前应用的结果
    fn fail_turn(&self, mut turn: ConversationTurn, err: EngineError, notice: &str) -> EngineError {
        error!(
            turn_id = %turn.id,
            kind = ?turn.kind,
            error = %err,
            error_type = err.stream_error().map(StreamError::code).unwrap_or("engine_error"),
            retryable = err.is_retryable(),
            partial_len = turn.buffer.len(),
            "生成失败"
        );
        turn.state = TurnState::Failed;
        turn.error = Some(err.to_string());

        let mut session = self.session.lock();
        session
            .messages
            .push(ChatMessage::system(format!("{}: {}", notice, err)));
        Self::transition(&mut session, TurnState::Failed);
        session.last_turn = Some(turn);
        err
    }

    fn prepare_code(&self, code: &str) -> (ExtractedPayload, RepairedPayload) {
        let extracted = extract(code, self.dialect);
        let repaired = repair(&extracted, self.dialect);
        (extracted, repaired)
    }

    fn remember_applied(&self, extracted: ExtractedPayload, repaired: &RepairedPayload) {
        let truncated = !missing_closers(extracted.as_str(), self.dialect).is_empty();
        let mut session = self.session.lock();
        session.used_code = repaired.as_str().to_string();
        session.applied = Some(AppliedPayload {
            extracted,
            truncated,
        });
    }

    async fn apply_to_canvas(&self, conversation_id: &str, repaired: &RepairedPayload) {
        if let Err(e) = self.canvas.apply(self.dialect, repaired).await {
            warn!(conversation_id = %conversation_id, error = %e, "应用到画布失败");
        }
        self.session.lock().used_code = repaired.as_str().to_string();
        self.update_used_code(conversation_id, repaired).await;
    }

    async fn update_used_code(&self, conversation_id: &str, repaired: &RepairedPayload) {
        if let Err(e) = self
            .history
            .update_used_code(conversation_id, repaired.as_str())
            .await
        {
            warn!(conversation_id = %conversation_id, error = %e, "更新历史代码失败");
        }
    }

    async fn record_history(
        &self,
        conversation_id: &str,
        message: ChatMessage,
        config: &LlmConfig,
        chart_type: &str,
    ) {
        let entry = HistoryEntry {
            conversation_id: conversation_id.to_string(),
            message,
            engine: self.dialect.history_tag().to_string(),
            config: config.clone(),
            chart_type: chart_type.to_string(),
        };
        if let Err(e) = self.history.add_message(entry).await {
            warn!(conversation_id = %conversation_id, error = %e, "写入历史记录失败");
        }
    }
}
