//! HTF 通用类型定义
//!
//! 此 crate 包含测试框架各组件之间共享的基础类型：
//! 被测目标、JSON 错误包装、事件模型以及暂停/取消信号上下文。

pub mod events;
pub mod signal;

use std::fmt;

use serde::{Deserialize, Serialize};

/// 被测目标（Device Under Test）
///
/// 运行器只把目标当作一个不透明的键，通过唯一 ID 区分。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// 目标唯一标识
    pub id: String,
}

impl Target {
    /// 创建新的目标
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

impl std::hash::Hash for Target {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// JSON 可序列化的错误包装
///
/// 用于目标级结果与事件负载的持久化，序列化为 `{"Error": "..."}`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonError {
    /// 错误消息
    #[serde(rename = "Error")]
    pub error: String,
}

impl JsonError {
    /// 包装一条错误消息
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}
