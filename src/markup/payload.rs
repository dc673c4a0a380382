//! 提取结果与修复结果的新类型
//!
//! 两者都是普通字符串，用类型区分“已提取”与“已修复”，
//! 渲染器只接受 [`RepairedPayload`]。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 从累积内容中提取出的标记文本
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedPayload(String);

/// 结构修复后的标记文本
///
/// 由 [`crate::markup::repair`] 产生，在对应方言下总是结构平衡的。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepairedPayload(String);

macro_rules! payload_impls {
    ($ty:ident) => {
        impl $ty {
            /// 以字符串切片访问
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// 取出内部字符串
            pub fn into_inner(self) -> String {
                self.0
            }

            /// 是否为空
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// 字节长度
            pub fn len(&self) -> usize {
                self.0.len()
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$ty> for String {
            fn from(payload: $ty) -> String {
                payload.0
            }
        }
    };
}

payload_impls!(ExtractedPayload);
payload_impls!(RepairedPayload);

impl ExtractedPayload {
    pub(crate) fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}

impl RepairedPayload {
    pub(crate) fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }
}
