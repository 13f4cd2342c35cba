//! 步骤间变量访问接口
//!
//! 变量按 目标 → 步骤标签 → 键 组织；写入仅限本步骤声明过的键，
//! 读取必须指明更早步骤的标签。具体存储由运行器实现。

use serde_json::Value;
use thiserror::Error;

/// 变量访问错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VariablesError {
    /// 写入了未声明的变量
    #[error("变量 {0} 未在步骤中声明")]
    NotDeclared(String),

    /// 变量名不合法
    #[error("变量名 {0} 不合法")]
    InvalidName(String),

    /// 读取了对当前步骤不可见的变量
    #[error("步骤 {0} 的变量对当前步骤不可见")]
    NotVisible(String),

    /// 引用的步骤不存在
    #[error("步骤 {0} 不存在")]
    UnknownStep(String),

    /// 变量不存在
    #[error("目标 {target} 在步骤 {step} 下没有变量 {name}")]
    NotFound {
        /// 目标 ID
        target: String,
        /// 产出步骤标签
        step: String,
        /// 变量名
        name: String,
    },
}

/// 步骤可见的变量袋
pub trait StepsVariables: Send + Sync {
    /// 以本步骤身份写入变量
    fn add(&self, target_id: &str, name: &str, value: Value) -> Result<(), VariablesError>;

    /// 读取更早步骤写入的变量
    fn get(&self, target_id: &str, step_label: &str, name: &str)
        -> Result<Value, VariablesError>;
}
