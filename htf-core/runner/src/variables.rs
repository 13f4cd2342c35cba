//! 步骤间变量存储
//!
//! 两级映射：目标 → 步骤标签 → 键 → 原始 JSON。写入受各步骤的
//! 声明约束，读取只允许访问更早步骤的输出。运行器不解释值本身。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use htf_step::{StepsVariables, TestStepBundle, VariablesError};

/// 全部目标的变量存储
pub struct VariablesStore {
    /// 步骤标签 → 流水线下标
    step_index: HashMap<String, usize>,

    /// 步骤标签 → 声明的可写键
    declared: HashMap<String, HashSet<String>>,

    /// 目标 → 步骤标签 → 键 → 值
    values: Mutex<HashMap<String, HashMap<String, HashMap<String, Value>>>>,
}

impl VariablesStore {
    /// 依据流水线构建存储并校验各步骤的声明
    pub fn new(bundles: &[TestStepBundle]) -> Result<Arc<Self>, VariablesError> {
        let mut step_index = HashMap::new();
        let mut declared = HashMap::new();
        for (i, bundle) in bundles.iter().enumerate() {
            for name in &bundle.variables {
                if !is_valid_name(name) {
                    return Err(VariablesError::InvalidName(name.clone()));
                }
            }
            step_index.insert(bundle.label.clone(), i);
            declared.insert(
                bundle.label.clone(),
                bundle.variables.iter().cloned().collect(),
            );
        }
        Ok(Arc::new(Self {
            step_index,
            declared,
            values: Mutex::new(HashMap::new()),
        }))
    }

    /// 从快照恢复某个目标的变量
    pub fn init_target(
        &self,
        target_id: &str,
        variables: &HashMap<String, HashMap<String, Value>>,
    ) -> Result<(), VariablesError> {
        for label in variables.keys() {
            if !self.step_index.contains_key(label) {
                return Err(VariablesError::UnknownStep(label.clone()));
            }
        }
        self.values
            .lock()
            .unwrap()
            .insert(target_id.to_string(), variables.clone());
        Ok(())
    }

    /// 导出某个目标的全部变量，写入下一份快照
    pub fn export_target(&self, target_id: &str) -> HashMap<String, HashMap<String, Value>> {
        self.values
            .lock()
            .unwrap()
            .get(target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 以某个步骤的身份创建访问句柄
    pub fn for_step(
        self: &Arc<Self>,
        label: &str,
    ) -> Result<Arc<dyn StepsVariables>, VariablesError> {
        let index = *self
            .step_index
            .get(label)
            .ok_or_else(|| VariablesError::UnknownStep(label.to_string()))?;
        Ok(Arc::new(StepVariablesAccess {
            store: Arc::clone(self),
            label: label.to_string(),
            index,
        }))
    }
}

/// 绑定到单个步骤的变量访问句柄
struct StepVariablesAccess {
    store: Arc<VariablesStore>,
    label: String,
    index: usize,
}

impl StepsVariables for StepVariablesAccess {
    fn add(&self, target_id: &str, name: &str, value: Value) -> Result<(), VariablesError> {
        if !is_valid_name(name) {
            return Err(VariablesError::InvalidName(name.to_string()));
        }
        let declared = self
            .store
            .declared
            .get(&self.label)
            .ok_or_else(|| VariablesError::UnknownStep(self.label.clone()))?;
        if !declared.contains(name) {
            return Err(VariablesError::NotDeclared(name.to_string()));
        }

        let mut values = self.store.values.lock().unwrap();
        values
            .entry(target_id.to_string())
            .or_default()
            .entry(self.label.clone())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    fn get(
        &self,
        target_id: &str,
        step_label: &str,
        name: &str,
    ) -> Result<Value, VariablesError> {
        let producer = *self
            .store
            .step_index
            .get(step_label)
            .ok_or_else(|| VariablesError::UnknownStep(step_label.to_string()))?;
        if producer >= self.index {
            return Err(VariablesError::NotVisible(step_label.to_string()));
        }

        let values = self.store.values.lock().unwrap();
        values
            .get(target_id)
            .and_then(|steps| steps.get(step_label))
            .and_then(|vars| vars.get(name))
            .cloned()
            .ok_or_else(|| VariablesError::NotFound {
                target: target_id.to_string(),
                step: step_label.to_string(),
                name: name.to_string(),
            })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
