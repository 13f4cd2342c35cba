//! 恢复快照编解码
//!
//! 快照是带版本号的 JSON。版本号与当前实现不符即拒绝恢复；
//! 阶段的整数标签跨版本保持稳定。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use htf_common::JsonError;

use crate::errors::RunnerError;

/// 当前兼容的快照版本；状态格式出现不兼容变更时递增
pub const RESUME_STATE_VERSION: i64 = 2;

/// 目标在某个步骤中的执行阶段
///
/// `Obsolete` 仅为解码历史快照保留，不再发出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TargetStepPhase {
    /// 程序错误哨兵
    Invalid,
    /// 刚到达步骤
    Init,
    /// 已被驱动任务拾取
    Begin,
    /// 已注入步骤，等待结果
    Run,
    /// 历史遗留阶段，仅保证可解码
    Obsolete,
    /// 步骤执行完毕
    End,
}

impl TargetStepPhase {
    fn is_invalid(&self) -> bool {
        *self == TargetStepPhase::Invalid
    }
}

impl Default for TargetStepPhase {
    fn default() -> Self {
        TargetStepPhase::Invalid
    }
}

impl From<TargetStepPhase> for u8 {
    fn from(phase: TargetStepPhase) -> Self {
        match phase {
            TargetStepPhase::Invalid => 0,
            TargetStepPhase::Init => 1,
            TargetStepPhase::Begin => 2,
            TargetStepPhase::Run => 3,
            TargetStepPhase::Obsolete => 4,
            TargetStepPhase::End => 5,
        }
    }
}

impl TryFrom<u8> for TargetStepPhase {
    type Error = String;

    fn try_from(tag: u8) -> std::result::Result<Self, Self::Error> {
        match tag {
            0 => Ok(TargetStepPhase::Invalid),
            1 => Ok(TargetStepPhase::Init),
            2 => Ok(TargetStepPhase::Begin),
            3 => Ok(TargetStepPhase::Run),
            4 => Ok(TargetStepPhase::Obsolete),
            5 => Ok(TargetStepPhase::End),
            other => Err(format!("未知阶段标签 {}", other)),
        }
    }
}

impl fmt::Display for TargetStepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TargetStepPhase::Invalid => "INVALID",
            TargetStepPhase::Init => "init",
            TargetStepPhase::Begin => "begin",
            TargetStepPhase::Run => "run",
            TargetStepPhase::Obsolete => "result_pending_obsolete",
            TargetStepPhase::End => "end",
        };
        write!(f, "{}", text)
    }
}

/// 单个目标可序列化的进度状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetState {
    /// 当前步骤下标
    #[serde(rename = "S", default, skip_serializing_if = "is_zero")]
    pub cur_step: usize,

    /// 当前阶段
    #[serde(rename = "P", default, skip_serializing_if = "TargetStepPhase::is_invalid")]
    pub cur_phase: TargetStepPhase,

    /// 终态错误
    #[serde(rename = "R", default, skip_serializing_if = "Option::is_none")]
    pub res: Option<JsonError>,

    /// 各步骤为该目标写入的变量
    #[serde(rename = "V", default, skip_serializing_if = "HashMap::is_empty")]
    pub steps_variables: HashMap<String, HashMap<String, Value>>,
}

impl TargetState {
    /// 位于流水线起点的新目标
    pub fn new() -> Self {
        Self {
            cur_step: 0,
            cur_phase: TargetStepPhase::Init,
            res: None,
            steps_variables: HashMap::new(),
        }
    }
}

impl Default for TargetState {
    fn default() -> Self {
        Self::new()
    }
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// 运行器恢复快照
#[derive(Debug, Serialize, Deserialize)]
pub struct ResumeState {
    /// 快照版本
    #[serde(rename = "V", default)]
    pub version: i64,

    /// 各目标的进度状态
    #[serde(rename = "T", default)]
    pub targets: HashMap<String, TargetState>,

    /// 各步骤的不透明恢复状态，与流水线同序
    #[serde(rename = "SRS", default, skip_serializing_if = "Vec::is_empty")]
    pub step_resume_states: Vec<Option<Value>>,
}

impl ResumeState {
    /// 解码并校验版本
    pub fn decode(raw: &[u8]) -> Result<Self, RunnerError> {
        let state: ResumeState = serde_json::from_slice(raw)
            .map_err(|e| RunnerError::InvalidResumeState(e.to_string()))?;
        if state.version != RESUME_STATE_VERSION {
            return Err(RunnerError::IncompatibleResumeState {
                got: state.version,
                want: RESUME_STATE_VERSION,
            });
        }
        Ok(state)
    }

    /// 编码为字节串
    pub fn encode(&self) -> Result<Vec<u8>, RunnerError> {
        serde_json::to_vec(self).map_err(|e| RunnerError::Internal(format!("无法序列化恢复状态: {}", e)))
    }
}
