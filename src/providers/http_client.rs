//! 流式生成接口的 HTTP 客户端
//!
//! 以 `POST {config, messages}` 调用单个流式端点，响应体为 SSE 字节流。
//! 访问密码模式下通过 `x-access-password` 请求头鉴权，API Key 不随请求发送。

use crate::config::{EngineConfig, LlmConfig};
use crate::models::ChatMessage;
use crate::streaming::traits::{reqwest_stream_to_stream_response, LlmClient, StreamResponse};
use crate::streaming::StreamError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// 访问密码请求头
pub const ACCESS_PASSWORD_HEADER: &str = "x-access-password";

/// 请求体
#[derive(Debug, Serialize)]
struct StreamRequestBody<'a> {
    config: &'a LlmConfig,
    messages: &'a [ChatMessage],
}

/// 基于 reqwest 的流式 LLM 客户端
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: Client,
    endpoint: String,
    access_password: Option<String>,
    request_timeout: Duration,
}

impl HttpLlmClient {
    /// 按引擎配置创建客户端
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    /// 使用已有的 reqwest Client 创建客户端
    pub fn with_client(client: Client, config: &EngineConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            access_password: config
                .access_password
                .clone()
                .filter(|password| !password.is_empty()),
            request_timeout: config.stream.request_timeout(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 是否处于访问密码模式
    pub fn password_mode(&self) -> bool {
        self.access_password.is_some()
    }

    fn build_request(&self, config: &LlmConfig, messages: &[ChatMessage]) -> reqwest::RequestBuilder {
        let wire_config = config.for_request(self.password_mode());
        let body = StreamRequestBody {
            config: &wire_config,
            messages,
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);

        if let Some(password) = &self.access_password {
            request = request.header(ACCESS_PASSWORD_HEADER, password);
        }
        request
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn stream_chat(
        &self,
        config: &LlmConfig,
        messages: &[ChatMessage],
    ) -> Result<StreamResponse, StreamError> {
        info!(
            endpoint = %self.endpoint,
            provider = %config.provider_type,
            model = %config.model,
            message_count = messages.len(),
            password_mode = self.password_mode(),
            "发起流式生成请求"
        );

        let send = self.build_request(config, messages).send();
        let resp = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| StreamError::Timeout)??;

        let status = resp.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or_default().to_string();
            let body = resp.text().await.unwrap_or_default();
            let error = error_from_response(status.as_u16(), &reason, &body);
            warn!(status = status.as_u16(), error = %error, "流式生成请求被拒绝");
            return Err(error);
        }

        Ok(reqwest_stream_to_stream_response(resp))
    }

    fn client_name(&self) -> &'static str {
        "http"
    }
}

/// 将非 2xx 响应转换为错误
///
/// 响应体为带 `error` 字段的 JSON 时使用该字段，否则使用状态描述。
pub(crate) fn error_from_response(status: u16, reason: &str, body: &str) -> StreamError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| match value.get("error") {
            Some(serde_json::Value::String(msg)) => Some(msg.clone()),
            Some(other) => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string()),
            None => None,
        })
        .filter(|msg| !msg.is_empty());

    match message {
        Some(message) => StreamError::provider(status, message),
        None if !reason.is_empty() => StreamError::provider(status, reason),
        None => StreamError::provider(status, "LLM 请求失败"),
    }
}
