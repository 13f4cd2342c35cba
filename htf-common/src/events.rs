//! 测试事件模型
//!
//! 事件由外部发射器持久化，运行器本身不负责落盘。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Target;

/// 步骤首次启动事件
pub const TEST_STEP_RUNNING_EVENT: &str = "TestStepRunningEvent";
/// 步骤正常结束事件
pub const TEST_STEP_FINISHED_EVENT: &str = "TestStepFinishedEvent";
/// 步骤致命错误事件，负载为人类可读的错误文本
pub const TEST_ERROR: &str = "TestError";
/// 目标进入步骤
pub const TARGET_IN: &str = "TargetIn";
/// 目标通过步骤
pub const TARGET_OUT: &str = "TargetOut";
/// 目标在步骤中失败，负载为 JSON 包装的错误
pub const TARGET_ERR: &str = "TargetErr";
/// 目标开始执行（由步骤插件发出）
pub const TEST_STARTED_EVENT: &str = "TestStartedEvent";
/// 目标执行成功（由步骤插件发出）
pub const TEST_FINISHED_EVENT: &str = "TestFinishedEvent";
/// 目标执行失败（由步骤插件发出）
pub const TEST_FAILED_EVENT: &str = "TestFailedEvent";

/// 事件错误类型
#[derive(Debug, Error)]
pub enum EventError {
    /// 插件发出了未声明的事件
    #[error("事件 {0} 未在步骤中声明")]
    NotAllowed(String),

    /// 持久化失败
    #[error("事件持久化失败: {0}")]
    Storage(String),
}

/// 单条测试事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// 事件名称
    pub name: String,

    /// 关联目标，步骤级事件为空
    pub target: Option<Target>,

    /// 事件负载（不透明 JSON）
    pub payload: Option<Value>,
}

impl EventData {
    /// 创建步骤级事件
    pub fn for_step(name: &str) -> Self {
        Self {
            name: name.to_string(),
            target: None,
            payload: None,
        }
    }

    /// 创建目标级事件
    pub fn for_target(name: &str, target: &Target) -> Self {
        Self {
            name: name.to_string(),
            target: Some(target.clone()),
            payload: None,
        }
    }

    /// 附加负载
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// 事件发射器
///
/// 由存储后端实现，负责事件的持久化与排序保证。
#[async_trait]
pub trait Emitter: Send + Sync {
    /// 发出一条事件
    async fn emit(&self, data: EventData) -> Result<(), EventError>;
}

/// 按步骤标签创建发射器的工厂
pub trait EmitterFactory: Send + Sync {
    /// 为指定步骤创建发射器
    fn new_emitter(&self, step_label: &str) -> Arc<dyn Emitter>;
}
