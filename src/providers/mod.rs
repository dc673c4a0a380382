//! LLM 请求客户端
//!
//! 引擎只依赖 [`crate::streaming::LlmClient`] trait，这里提供基于 HTTP 的实现。

pub mod http_client;

pub use http_client::{HttpLlmClient, ACCESS_PASSWORD_HEADER};
