//! 集成测试公共设施：内存事件存储与示例插件注册

pub mod steps;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use htf_common::events::{Emitter, EmitterFactory, EventData, EventError};
use htf_common::signal::SignalContext;
use htf_common::Target;
use htf_runner::{RunResult, TestRunner};
use htf_step::{Parameters, StepRegistry, Test, TestStepBundle};

/// 内存中的一条事件记录
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub run_id: u64,
    pub step_label: String,
    pub data: EventData,
    pub timestamp: DateTime<Utc>,
}

/// 测试用内存事件存储
///
/// 同一份存储可以被多次运行共用，记录按运行号区分。
#[derive(Default)]
pub struct MemoryEventStorage {
    events: Mutex<Vec<StoredEvent>>,
}

impl MemoryEventStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 指定运行号创建发射器工厂
    pub fn factory(self: &Arc<Self>, run_id: u64) -> Arc<dyn EmitterFactory> {
        Arc::new(MemoryEmitterFactory {
            storage: Arc::clone(self),
            run_id,
        })
    }

    /// 某步骤的步骤级事件名（不含目标级事件），跨运行
    pub fn step_event_names(&self, label: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.step_label == label && e.data.target.is_none())
            .map(|e| e.data.name.clone())
            .collect()
    }

    /// 限定运行号的步骤级事件名
    pub fn step_event_names_for_run(&self, run_id: u64, label: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.run_id == run_id && e.step_label == label && e.data.target.is_none())
            .map(|e| e.data.name.clone())
            .collect()
    }

    /// 某目标的事件名，跨步骤按记录顺序，带步骤标签前缀
    pub fn target_event_names(&self, target_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.data
                    .target
                    .as_ref()
                    .map(|t| t.id == target_id)
                    .unwrap_or(false)
            })
            .map(|e| format!("{}/{}", e.step_label, e.data.name))
            .collect()
    }

    /// 限定运行号的目标事件名
    pub fn target_event_names_for_run(&self, run_id: u64, target_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.run_id == run_id
                    && e.data
                        .target
                        .as_ref()
                        .map(|t| t.id == target_id)
                        .unwrap_or(false)
            })
            .map(|e| format!("{}/{}", e.step_label, e.data.name))
            .collect()
    }

    /// 某目标在某个步骤里的事件名
    pub fn target_step_event_names(&self, label: &str, target_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.step_label == label
                    && e.data
                        .target
                        .as_ref()
                        .map(|t| t.id == target_id)
                        .unwrap_or(false)
            })
            .map(|e| e.data.name.clone())
            .collect()
    }

    /// 某步骤的事件负载里是否出现了指定文本
    pub fn step_events_contain(&self, label: &str, needle: &str) -> bool {
        self.events.lock().unwrap().iter().any(|e| {
            e.step_label == label
                && e.data
                    .payload
                    .as_ref()
                    .map(|p| p.to_string().contains(needle))
                    .unwrap_or(false)
        })
    }

    /// 记录时间戳应当单调不减
    pub fn assert_timestamps_ordered(&self) {
        let events = self.events.lock().unwrap();
        for pair in events.windows(2) {
            assert!(
                pair[0].timestamp <= pair[1].timestamp,
                "事件时间戳出现回退"
            );
        }
    }
}

struct MemoryEmitterFactory {
    storage: Arc<MemoryEventStorage>,
    run_id: u64,
}

impl EmitterFactory for MemoryEmitterFactory {
    fn new_emitter(&self, step_label: &str) -> Arc<dyn Emitter> {
        Arc::new(MemoryEmitter {
            storage: Arc::clone(&self.storage),
            run_id: self.run_id,
            step_label: step_label.to_string(),
        })
    }
}

struct MemoryEmitter {
    storage: Arc<MemoryEventStorage>,
    run_id: u64,
    step_label: String,
}

#[async_trait]
impl Emitter for MemoryEmitter {
    async fn emit(&self, data: EventData) -> Result<(), EventError> {
        self.storage.events.lock().unwrap().push(StoredEvent {
            run_id: self.run_id,
            step_label: self.step_label.clone(),
            data,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// 注册全部示例插件
pub fn test_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry
        .register(steps::SAMPLE_NAME, steps::sample_factory(), vec![])
        .unwrap();
    registry
        .register(steps::NORETURN_NAME, steps::noreturn_factory(), vec![])
        .unwrap();
    registry
        .register(steps::PANIC_NAME, steps::panic_factory(), vec![])
        .unwrap();
    registry
        .register(steps::CHANNELS_NAME, steps::channels_factory(), vec![])
        .unwrap();
    registry
        .register(steps::BADTARGETS_NAME, steps::badtargets_factory(), vec![])
        .unwrap();
    registry
        .register(steps::PAUSEAWARE_NAME, steps::pauseaware_factory(), vec![])
        .unwrap();
    registry
        .register(steps::VARIABLES_NAME, steps::variables_factory(), vec![])
        .unwrap();
    registry
}

/// 构造可配置示例步骤
pub fn sample_step(
    registry: &StepRegistry,
    label: &str,
    fail_pct: i64,
    fail_targets: &str,
    delay_targets: &str,
) -> TestStepBundle {
    registry
        .new_bundle(
            steps::SAMPLE_NAME,
            label,
            Parameters::new()
                .set("fail_pct", fail_pct)
                .set("fail_targets", fail_targets)
                .set("delay_targets", delay_targets),
            vec![],
        )
        .unwrap()
}

/// 简写：构造目标
pub fn tgt(id: &str) -> Target {
    Target::new(id)
}

/// 调试失败用例时打开日志输出
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// 带超时运行，防止测试悬挂
pub async fn run_with_timeout(
    runner: &TestRunner,
    ctx: &SignalContext,
    test: &Test,
    targets: &[Target],
    factory: Arc<dyn EmitterFactory>,
    resume_state: Option<&[u8]>,
) -> RunResult {
    tokio::time::timeout(
        Duration::from_secs(5),
        runner.run(ctx, test, targets, factory, resume_state),
    )
    .await
    .expect("运行器不应超时")
}
