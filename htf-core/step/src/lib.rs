//! HTF 步骤插件接口
//!
//! 定义步骤插件与运行器之间的全部契约：插件 trait、输入输出通道、
//! 流水线描述、插件注册表以及步骤间变量访问。

pub mod bundle;
pub mod helpers;
pub mod registry;
pub mod step;
pub mod variables;

pub use bundle::{Parameters, Test, TestStepBundle};
pub use registry::{RegistryError, StepFactory, StepRegistry};
pub use step::{StepError, StepInput, StepResult, TestStep, TestStepChannels};
pub use variables::{StepsVariables, VariablesError};
