//! 运行器错误定义

use thiserror::Error;

/// 运行器结果类型
pub type Result<T> = std::result::Result<T, RunnerError>;

/// 运行级错误
///
/// 首个非暂停错误决定整次运行的结果。事件中可见的错误文本保持
/// 稳定，外部消费方会对其做匹配。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    /// 运行因暂停信号结束
    #[error("test run paused")]
    Paused,

    /// 运行因取消信号结束
    #[error("test run canceled")]
    Canceled,

    /// 步骤在关停超时内未返回
    #[error("test step [{}] did not return", .0.join(", "))]
    NeverReturned(Vec<String>),

    /// 步骤插件崩溃
    #[error("test step {step} paniced: {message}")]
    Paniced {
        /// 步骤标签
        step: String,
        /// 崩溃负载
        message: String,
    },

    /// 步骤关闭了输出通道
    #[error("test step {0} closed output channels (api violation)")]
    ClosedChannels(String),

    /// 步骤为未注入或未等待的目标产出了结果
    #[error("test step {step} returned unexpected result for {target}")]
    UnexpectedResult {
        /// 步骤标签
        step: String,
        /// 目标 ID
        target: String,
    },

    /// 步骤为同一次注入产出了重复结果
    #[error("test step {step} returned duplicate result for {target}")]
    DuplicateResult {
        /// 步骤标签
        step: String,
        /// 目标 ID
        target: String,
    },

    /// 步骤返回后仍有目标未得到结果
    #[error("test step {step} lost targets {targets:?}")]
    LostTargets {
        /// 步骤标签
        step: String,
        /// 丢失的目标 ID
        targets: Vec<String>,
    },

    /// 步骤主体返回错误
    #[error("test step {step} failed: {message}")]
    StepFailed {
        /// 步骤标签
        step: String,
        /// 错误消息
        message: String,
    },

    /// 恢复状态无法解析
    #[error("invalid resume state: {0}")]
    InvalidResumeState(String),

    /// 恢复状态版本不兼容
    #[error("incompatible resume state version {got} (want {want})")]
    IncompatibleResumeState {
        /// 快照中的版本
        got: i64,
        /// 期望版本
        want: i64,
    },

    /// 不应出现的内部一致性错误
    #[error("internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    /// 是否为暂停哨兵
    pub fn is_pause(&self) -> bool {
        matches!(self, RunnerError::Paused)
    }
}
