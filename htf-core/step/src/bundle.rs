//! 测试与步骤流水线描述

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::step::TestStep;

/// 步骤参数集合
///
/// 键值对形式的插件配置，值为不透明 JSON。
#[derive(Debug, Clone, Default)]
pub struct Parameters(HashMap<String, Value>);

impl Parameters {
    /// 创建空参数集
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// 设置参数
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    /// 取原始参数值
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// 取字符串参数
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// 取整数参数
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }
}

/// 一个步骤及其静态配置
#[derive(Clone)]
pub struct TestStepBundle {
    /// 步骤标签，在流水线内唯一
    pub label: String,

    /// 插件实例
    pub step: Arc<dyn TestStep>,

    /// 插件参数
    pub parameters: Parameters,

    /// 插件声明可发出的事件名
    pub allowed_events: Vec<String>,

    /// 插件声明可写入的变量名
    pub variables: Vec<String>,
}

impl std::fmt::Debug for TestStepBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStepBundle")
            .field("label", &self.label)
            .field("parameters", &self.parameters)
            .field("allowed_events", &self.allowed_events)
            .field("variables", &self.variables)
            .finish()
    }
}

/// 一次测试：有序的步骤流水线
#[derive(Clone)]
pub struct Test {
    /// 测试名称
    pub name: String,

    /// 按执行顺序排列的步骤
    pub steps: Vec<TestStepBundle>,
}
