//! 示例步骤插件
//!
//! 与运行器测试配套的插件集合：可配置的常规步骤、不返回的步骤、
//! 崩溃的步骤、关闭通道的步骤、产出错误结果的步骤、可暂停恢复的
//! 步骤以及读写变量的步骤。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use htf_common::events::{
    Emitter, EventData, TEST_FAILED_EVENT, TEST_FINISHED_EVENT, TEST_STARTED_EVENT,
};
use htf_common::signal::SignalContext;
use htf_common::{JsonError, Target};
use htf_step::helpers::for_each_target;
use htf_step::{
    Parameters, StepError, StepFactory, StepResult, StepsVariables, TestStep, TestStepChannels,
};

pub const SAMPLE_NAME: &str = "sample";
pub const NORETURN_NAME: &str = "noreturn";
pub const PANIC_NAME: &str = "panicstep";
pub const CHANNELS_NAME: &str = "channels";
pub const BADTARGETS_NAME: &str = "badtargets";
pub const PAUSEAWARE_NAME: &str = "pauseaware";
pub const VARIABLES_NAME: &str = "variables";

pub fn sample_factory() -> StepFactory {
    Arc::new(|| Arc::new(SampleStep))
}

pub fn noreturn_factory() -> StepFactory {
    Arc::new(|| Arc::new(NoReturnStep))
}

pub fn panic_factory() -> StepFactory {
    Arc::new(|| Arc::new(PanicStep))
}

pub fn channels_factory() -> StepFactory {
    Arc::new(|| Arc::new(ChannelsStep))
}

pub fn badtargets_factory() -> StepFactory {
    Arc::new(|| Arc::new(BadTargetsStep))
}

pub fn pauseaware_factory() -> StepFactory {
    Arc::new(|| Arc::new(PauseAwareStep))
}

pub fn variables_factory() -> StepFactory {
    Arc::new(|| Arc::new(VariablesStep))
}

/// 可配置的常规步骤
///
/// 参数：
/// - `fail_pct`：按目标 ID 哈希判定的失败百分比
/// - `fail_targets`：逗号分隔的必败目标列表
/// - `delay_targets`：`T1=100,T2=200` 形式的逐目标延迟（毫秒），
///   `*` 为默认值
pub struct SampleStep;

#[async_trait]
impl TestStep for SampleStep {
    async fn run(
        &self,
        ctx: SignalContext,
        channels: TestStepChannels,
        emitter: Arc<dyn Emitter>,
        _variables: Arc<dyn StepsVariables>,
        parameters: &Parameters,
        _resume_state: Option<Value>,
    ) -> Result<Option<Value>, StepError> {
        let fail_pct = parameters.get_i64("fail_pct").unwrap_or(0);
        let fail_targets = parse_list(parameters.get_str("fail_targets").unwrap_or(""));
        let delays = Delays::parse(parameters.get_str("delay_targets").unwrap_or(""));

        for_each_target(&ctx, &channels, |_target_ctx, target| {
            let emitter = Arc::clone(&emitter);
            let fail = fail_targets.contains(&target.id)
                || (fail_pct > 0 && (hash_pct(&target.id) as i64) < fail_pct);
            let delay = delays.for_target(&target.id);
            async move {
                let _ = emitter
                    .emit(EventData::for_target(TEST_STARTED_EVENT, &target))
                    .await;
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if fail {
                    let _ = emitter
                        .emit(EventData::for_target(TEST_FAILED_EVENT, &target))
                        .await;
                    Some(JsonError::new("target failed"))
                } else {
                    let _ = emitter
                        .emit(EventData::for_target(TEST_FINISHED_EVENT, &target))
                        .await;
                    None
                }
            }
        })
        .await?;
        Ok(None)
    }
}

/// 正确处理每个目标，但在输入耗尽后永不返回
pub struct NoReturnStep;

#[async_trait]
impl TestStep for NoReturnStep {
    async fn run(
        &self,
        _ctx: SignalContext,
        channels: TestStepChannels,
        _emitter: Arc<dyn Emitter>,
        _variables: Arc<dyn StepsVariables>,
        _parameters: &Parameters,
        _resume_state: Option<Value>,
    ) -> Result<Option<Value>, StepError> {
        while let Some(target) = channels.inp.recv().await {
            let _ = channels
                .out
                .send(StepResult { target, err: None })
                .await;
        }
        std::future::pending::<()>().await;
        Ok(None)
    }
}

/// 一进入就崩溃的步骤
pub struct PanicStep;

#[async_trait]
impl TestStep for PanicStep {
    async fn run(
        &self,
        _ctx: SignalContext,
        _channels: TestStepChannels,
        _emitter: Arc<dyn Emitter>,
        _variables: Arc<dyn StepsVariables>,
        _parameters: &Parameters,
        _resume_state: Option<Value>,
    ) -> Result<Option<Value>, StepError> {
        panic!("deliberate panic in test step");
    }
}

/// 处理完目标后关闭输出通道（违约）
pub struct ChannelsStep;

#[async_trait]
impl TestStep for ChannelsStep {
    async fn run(
        &self,
        _ctx: SignalContext,
        channels: TestStepChannels,
        _emitter: Arc<dyn Emitter>,
        _variables: Arc<dyn StepsVariables>,
        _parameters: &Parameters,
        _resume_state: Option<Value>,
    ) -> Result<Option<Value>, StepError> {
        while let Some(target) = channels.inp.recv().await {
            let _ = channels
                .out
                .send(StepResult { target, err: None })
                .await;
        }
        channels.out.close();
        Ok(None)
    }
}

/// 按目标 ID 产出各种违约结果的步骤
///
/// - `TDrop`：消费后不产出结果
/// - `TDup`：产出两次结果
/// - `TExtra`：额外为不存在的 `TExtra2` 产出结果
/// - 其余目标正常通过
pub struct BadTargetsStep;

#[async_trait]
impl TestStep for BadTargetsStep {
    async fn run(
        &self,
        _ctx: SignalContext,
        channels: TestStepChannels,
        _emitter: Arc<dyn Emitter>,
        _variables: Arc<dyn StepsVariables>,
        _parameters: &Parameters,
        _resume_state: Option<Value>,
    ) -> Result<Option<Value>, StepError> {
        while let Some(target) = channels.inp.recv().await {
            match target.id.as_str() {
                "TDrop" => {}
                "TDup" => {
                    let _ = channels
                        .out
                        .send(StepResult {
                            target: target.clone(),
                            err: None,
                        })
                        .await;
                    let _ = channels
                        .out
                        .send(StepResult { target, err: None })
                        .await;
                }
                "TExtra" => {
                    let _ = channels
                        .out
                        .send(StepResult { target, err: None })
                        .await;
                    let _ = channels
                        .out
                        .send(StepResult {
                            target: Target::new("TExtra2"),
                            err: None,
                        })
                        .await;
                }
                _ => {
                    let _ = channels
                        .out
                        .send(StepResult { target, err: None })
                        .await;
                }
            }
        }
        Ok(None)
    }
}

/// 观察暂停信号并携带恢复状态中止的步骤
///
/// 每个目标模拟一段长工作；收到暂停信号时把进行中的目标 ID 写进
/// 恢复状态返回。恢复运行时先为这些目标补发结果。
pub struct PauseAwareStep;

#[async_trait]
impl TestStep for PauseAwareStep {
    async fn run(
        &self,
        ctx: SignalContext,
        channels: TestStepChannels,
        _emitter: Arc<dyn Emitter>,
        _variables: Arc<dyn StepsVariables>,
        _parameters: &Parameters,
        resume_state: Option<Value>,
    ) -> Result<Option<Value>, StepError> {
        if let Some(state) = resume_state {
            let pending: Vec<String> = serde_json::from_value(state)
                .map_err(|e| StepError::Failed(format!("恢复状态损坏: {}", e)))?;
            for id in pending {
                let _ = channels
                    .out
                    .send(StepResult {
                        target: Target::new(id),
                        err: None,
                    })
                    .await;
            }
        }

        loop {
            tokio::select! {
                next = channels.inp.recv() => match next {
                    Some(target) => {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                                let _ = channels
                                    .out
                                    .send(StepResult { target, err: None })
                                    .await;
                            }
                            _ = ctx.paused() => {
                                return Err(StepError::Paused {
                                    resume_state: Some(serde_json::json!([target.id])),
                                });
                            }
                            _ = ctx.canceled() => return Ok(None),
                        }
                    }
                    None => break,
                },
                _ = ctx.canceled() => break,
            }
        }
        Ok(None)
    }
}

/// 读写步骤间变量的步骤
///
/// 为每个目标写入 `target_id` 变量；配置了 `read_step` 时从该步骤
/// 读回并校验。
pub struct VariablesStep;

#[async_trait]
impl TestStep for VariablesStep {
    async fn run(
        &self,
        _ctx: SignalContext,
        channels: TestStepChannels,
        _emitter: Arc<dyn Emitter>,
        variables: Arc<dyn StepsVariables>,
        parameters: &Parameters,
        _resume_state: Option<Value>,
    ) -> Result<Option<Value>, StepError> {
        let read_step = parameters.get_str("read_step").map(|s| s.to_string());
        while let Some(target) = channels.inp.recv().await {
            let mut err = None;
            if let Err(e) =
                variables.add(&target.id, "target_id", Value::String(target.id.clone()))
            {
                err = Some(JsonError::new(format!("写入变量失败: {}", e)));
            }
            if err.is_none() {
                if let Some(step) = &read_step {
                    match variables.get(&target.id, step, "target_id") {
                        Ok(value) if value == Value::String(target.id.clone()) => {}
                        Ok(value) => {
                            err = Some(JsonError::new(format!("变量值不符: {}", value)));
                        }
                        Err(e) => {
                            err = Some(JsonError::new(format!("读取变量失败: {}", e)));
                        }
                    }
                }
            }
            let _ = channels.out.send(StepResult { target, err }).await;
        }
        Ok(None)
    }
}

fn parse_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 逐目标延迟配置
struct Delays {
    per_target: HashMap<String, u64>,
    star: u64,
}

impl Delays {
    fn parse(raw: &str) -> Self {
        let mut per_target = HashMap::new();
        let mut star = 0;
        for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Some((id, ms)) = part.split_once('=') {
                if let Ok(ms) = ms.trim().parse::<u64>() {
                    if id.trim() == "*" {
                        star = ms;
                    } else {
                        per_target.insert(id.trim().to_string(), ms);
                    }
                }
            }
        }
        Self { per_target, star }
    }

    fn for_target(&self, id: &str) -> u64 {
        self.per_target.get(id).copied().unwrap_or(self.star)
    }
}

/// 目标 ID 的稳定百分比哈希，保证跨运行可复现
fn hash_pct(id: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish() % 100
}
