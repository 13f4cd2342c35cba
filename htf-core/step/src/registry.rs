//! 步骤插件注册表
//!
//! 按名称管理插件工厂及其声明的事件，流水线步骤由此构造。

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::bundle::{Parameters, TestStepBundle};
use crate::step::TestStep;

/// 插件工厂函数
pub type StepFactory = Arc<dyn Fn() -> Arc<dyn TestStep> + Send + Sync>;

/// 注册表错误
#[derive(Debug, Error)]
pub enum RegistryError {
    /// 重复注册
    #[error("步骤插件 {0} 已注册")]
    AlreadyRegistered(String),

    /// 插件不存在
    #[error("步骤插件 {0} 不存在")]
    NotFound(String),
}

struct Entry {
    factory: StepFactory,
    events: Vec<String>,
}

/// 步骤插件注册表
#[derive(Default)]
pub struct StepRegistry {
    entries: HashMap<String, Entry>,
}

impl StepRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册插件及其声明可发出的事件
    pub fn register(
        &mut self,
        name: &str,
        factory: StepFactory,
        events: Vec<String>,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        self.entries
            .insert(name.to_string(), Entry { factory, events });
        Ok(())
    }

    /// 以已注册的插件构造一个流水线步骤
    pub fn new_bundle(
        &self,
        name: &str,
        label: &str,
        parameters: Parameters,
        variables: Vec<String>,
    ) -> Result<TestStepBundle, RegistryError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        Ok(TestStepBundle {
            label: label.to_string(),
            step: (entry.factory)(),
            parameters,
            allowed_events: entry.events.clone(),
            variables,
        })
    }
}
