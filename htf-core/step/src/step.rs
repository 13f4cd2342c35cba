//! 测试步骤插件契约

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use htf_common::events::{Emitter, EventData, TARGET_IN};
use htf_common::signal::SignalContext;
use htf_common::{JsonError, Target};

use crate::bundle::Parameters;
use crate::variables::StepsVariables;

/// 步骤执行错误
#[derive(Debug, Error)]
pub enum StepError {
    /// 步骤观察到暂停信号后中止，可携带恢复状态
    #[error("test step paused")]
    Paused {
        /// 恢复运行时交还给步骤的状态
        resume_state: Option<Value>,
    },

    /// 步骤自身执行失败
    #[error("{0}")]
    Failed(String),
}

/// 单个目标在一个步骤中的执行结果
#[derive(Debug, Clone)]
pub struct StepResult {
    /// 对应目标
    pub target: Target,

    /// 失败原因，None 表示通过
    pub err: Option<JsonError>,
}

/// 步骤输入端
///
/// 逐个取出注入的目标。取出动作同时记录 TargetIn 事件，
/// 因此步骤从未消费的目标不会留下任何目标级事件。
pub struct StepInput {
    rx: async_channel::Receiver<Target>,
    emitter: Arc<dyn Emitter>,
}

impl StepInput {
    /// 由运行器构造
    pub fn new(rx: async_channel::Receiver<Target>, emitter: Arc<dyn Emitter>) -> Self {
        Self { rx, emitter }
    }

    /// 取出下一个目标；输入关闭且取空后返回 None
    pub async fn recv(&self) -> Option<Target> {
        match self.rx.recv().await {
            Ok(target) => {
                let event = EventData::for_target(TARGET_IN, &target);
                if let Err(e) = self.emitter.emit(event).await {
                    warn!("记录 TargetIn 事件失败: {}", e);
                }
                Some(target)
            }
            Err(_) => None,
        }
    }
}

/// 步骤与运行器之间的通道
pub struct TestStepChannels {
    /// 输入端：待处理目标
    pub inp: StepInput,

    /// 输出端：逐目标结果；步骤不得关闭此通道
    pub out: async_channel::Sender<StepResult>,
}

/// 测试步骤插件
///
/// 实现方必须遵守：消费输入中的每个目标并恰好产出一个结果；
/// 不得为未接收的目标产出结果；上下文取消后尽快返回；
/// 不得关闭输出通道。
#[async_trait]
pub trait TestStep: Send + Sync {
    /// 运行步骤主体，Ok 值为可选的不透明恢复状态
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        ctx: SignalContext,
        channels: TestStepChannels,
        emitter: Arc<dyn Emitter>,
        variables: Arc<dyn StepsVariables>,
        parameters: &Parameters,
        resume_state: Option<Value>,
    ) -> Result<Option<Value>, StepError>;
}
