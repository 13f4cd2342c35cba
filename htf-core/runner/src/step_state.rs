//! 单个步骤的生命周期管理
//!
//! 每个步骤持有一个 worker（插件主体）和一个 reader（结果分发器）。
//! worker 包裹在崩溃边界内运行；reader 是插件违约行为的唯一仲裁者，
//! 负责把逐目标结果分发给等待中的驱动任务。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

use htf_common::events::{
    Emitter, EmitterFactory, EventData, EventError, TARGET_ERR, TARGET_OUT, TEST_ERROR,
    TEST_FAILED_EVENT, TEST_FINISHED_EVENT, TEST_STARTED_EVENT, TEST_STEP_FINISHED_EVENT,
    TEST_STEP_RUNNING_EVENT,
};
use htf_common::signal::SignalContext;
use htf_common::{JsonError, Target};
use htf_step::{StepError, StepInput, StepResult, StepsVariables, TestStepBundle, TestStepChannels};

use crate::errors::RunnerError;

/// 每次注入对应的结果通知端
pub type ResultNotifier = oneshot::Receiver<Option<JsonError>>;

type WorkerOutcome = Result<Result<Option<Value>, StepError>, JoinError>;

/// reader 的记账状态
#[derive(Default)]
struct ReaderBook {
    /// 已注入且尚未出结果的目标 → 通知发送端
    pending: HashMap<String, oneshot::Sender<Option<JsonError>>>,

    /// 恢复运行时预登记的通知接收端，等待驱动任务认领
    resume_waiters: HashMap<String, ResultNotifier>,

    /// 已经出过结果的目标，用于识别重复结果
    resulted: HashSet<String>,
}

/// 单个步骤的运行时状态
pub struct StepState {
    index: usize,
    label: String,
    bundle: TestStepBundle,
    emitter: Arc<dyn Emitter>,
    variables: Arc<dyn StepsVariables>,

    /// 步骤专属上下文，强停时取消
    ctx: SignalContext,

    input_tx: async_channel::Sender<Target>,
    input_rx: Mutex<Option<async_channel::Receiver<Target>>>,
    /// 运行器保留的发送端；插件自己的克隆被丢弃不会关闭通道，
    /// 只有显式 close 会被判定为违约
    output_tx: async_channel::Sender<StepResult>,
    output_rx: Mutex<Option<async_channel::Receiver<StepResult>>>,

    /// 尚未越过本步骤的目标数，减到零时关闭输入通道
    left_targets: Mutex<usize>,
    /// 一次性启动闩
    started: Mutex<bool>,
    /// 首个致命错误，先写优先
    err: Mutex<Option<RunnerError>>,
    /// 错误上报到监控循环
    errors_tx: mpsc::Sender<RunnerError>,

    book: Mutex<ReaderBook>,

    /// 恢复快照提供的初始状态
    init_resume_state: Option<Value>,
    /// 恢复运行时已注入未出结果的目标
    resume_targets: Vec<Target>,
    /// worker 结束后捕获的恢复状态
    last_resume_state: Mutex<Option<Value>>,

    /// worker 与 reader 均已退出
    stopped_tx: watch::Sender<bool>,
}

impl StepState {
    /// 创建冷状态的步骤；worker 在首个目标到达时才启动
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        bundle: TestStepBundle,
        emitter_factory: &dyn EmitterFactory,
        variables: Arc<dyn StepsVariables>,
        left_targets: usize,
        init_resume_state: Option<Value>,
        resume_targets: Vec<Target>,
        run_ctx: &SignalContext,
        errors_tx: mpsc::Sender<RunnerError>,
    ) -> Arc<Self> {
        let (input_tx, input_rx) = async_channel::unbounded();
        let (output_tx, output_rx) = async_channel::unbounded();
        if left_targets == 0 {
            // 没有目标会经过本步骤，输入通道从一开始就是关闭的
            input_tx.close();
        }
        let (stopped_tx, _) = watch::channel(false);
        let emitter = emitter_factory.new_emitter(&bundle.label);

        Arc::new(Self {
            index,
            label: bundle.label.clone(),
            bundle,
            emitter,
            variables,
            ctx: run_ctx.child(),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            left_targets: Mutex::new(left_targets),
            started: Mutex::new(false),
            err: Mutex::new(None),
            errors_tx,
            book: Mutex::new(ReaderBook::default()),
            init_resume_state,
            resume_targets,
            last_resume_state: Mutex::new(None),
            stopped_tx,
        })
    }

    /// 步骤标签
    pub fn label(&self) -> &str {
        &self.label
    }

    /// 是否已启动
    pub fn started(&self) -> bool {
        *self.started.lock().unwrap()
    }

    /// 当前错误快照
    pub fn get_error(&self) -> Option<RunnerError> {
        self.err.lock().unwrap().clone()
    }

    /// 幂等启动 worker 与 reader；只有首次调用生效
    pub async fn run(self: &Arc<Self>) -> Result<(), RunnerError> {
        if let Some(err) = self.get_error() {
            return Err(err);
        }
        if self.ctx.is_canceled() {
            return Err(RunnerError::Canceled);
        }

        let (input_rx, output_rx) = {
            let mut started = self.started.lock().unwrap();
            if *started {
                return Ok(());
            }
            *started = true;

            // 预登记恢复运行中的目标：它们已注入过，只等结果
            let mut book = self.book.lock().unwrap();
            for target in &self.resume_targets {
                let (tx, rx) = oneshot::channel();
                book.pending.insert(target.id.clone(), tx);
                book.resume_waiters.insert(target.id.clone(), rx);
            }

            let input_rx = self.input_rx.lock().unwrap().take();
            let output_rx = self.output_rx.lock().unwrap().take();
            (input_rx, output_rx)
        };
        let (input_rx, output_rx) = match (input_rx, output_rx) {
            (Some(i), Some(o)) => (i, o),
            _ => {
                return Err(RunnerError::Internal(format!(
                    "步骤 {} 的通道已被移出",
                    self.label
                )))
            }
        };

        debug!("启动步骤 {} (下标 {})", self.label, self.index);
        self.emit(EventData::for_step(TEST_STEP_RUNNING_EVENT)).await;

        let channels = TestStepChannels {
            inp: StepInput::new(input_rx, Arc::clone(&self.emitter)),
            out: self.output_tx.clone(),
        };
        let step_emitter: Arc<dyn Emitter> = Arc::new(CheckedEmitter::new(
            Arc::clone(&self.emitter),
            &self.bundle.allowed_events,
        ));

        let step = Arc::clone(&self.bundle.step);
        let parameters = self.bundle.parameters.clone();
        let step_ctx = self.ctx.clone();
        let variables = Arc::clone(&self.variables);
        let resume_state = self.init_resume_state.clone();
        let worker = tokio::spawn(async move {
            step.run(
                step_ctx,
                channels,
                step_emitter,
                variables,
                &parameters,
                resume_state,
            )
            .await
        });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.read_results(worker, output_rx).await });
        Ok(())
    }

    /// 注入目标并返回本次注入的结果通知端
    ///
    /// 恢复运行中已注入的目标直接认领预登记的通知端，不会重复投递。
    pub async fn inject_target(&self, target: &Target) -> Result<ResultNotifier, RunnerError> {
        let notifier = {
            let mut book = self.book.lock().unwrap();
            if let Some(rx) = book.resume_waiters.remove(&target.id) {
                Some(rx)
            } else if book.pending.contains_key(&target.id) || book.resulted.contains(&target.id) {
                return Err(RunnerError::Internal(format!(
                    "目标 {} 已注入过步骤 {}",
                    target.id, self.label
                )));
            } else {
                None
            }
        };
        if let Some(rx) = notifier {
            debug!("目标 {} 恢复等待步骤 {} 的结果", target.id, self.label);
            return Ok(rx);
        }

        let (tx, rx) = oneshot::channel();
        // 登记必须先于投递，避免结果先于登记到达
        self.book.lock().unwrap().pending.insert(target.id.clone(), tx);
        if self.input_tx.send(target.clone()).await.is_err() {
            self.book.lock().unwrap().pending.remove(&target.id);
            return Err(self.get_error().unwrap_or(RunnerError::Canceled));
        }
        Ok(rx)
    }

    /// 目标越过本步骤时调用；减到零后关闭输入通道
    pub fn decrease_left_targets(&self) {
        let mut left = self.left_targets.lock().unwrap();
        if *left == 0 {
            warn!("步骤 {} 的剩余目标计数已为零", self.label);
            return;
        }
        *left -= 1;
        if *left == 0 {
            debug!("步骤 {} 的全部目标已越过，关闭输入通道", self.label);
            self.input_tx.close();
        }
    }

    /// 强停：取消步骤上下文并关闭输入通道，使 worker 与 reader 解除阻塞
    pub fn force_stop(&self) {
        self.ctx.cancel();
        self.input_tx.close();
    }

    /// 等待 worker 与 reader 全部退出
    pub async fn wait_stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 步骤的恢复状态：未启动的步骤原样回传初始状态
    pub fn resume_state(&self) -> Option<Value> {
        if !self.started() {
            return self.init_resume_state.clone();
        }
        self.last_resume_state.lock().unwrap().clone()
    }

    /// 记录首个致命错误；后到的错误只记日志
    pub async fn set_error(&self, err: RunnerError) {
        {
            let mut slot = self.err.lock().unwrap();
            if let Some(existing) = slot.as_ref() {
                debug!("步骤 {} 已有错误「{}」，忽略「{}」", self.label, existing, err);
                return;
            }
            *slot = Some(err.clone());
        }
        if !err.is_pause() {
            error!("步骤 {} 失败: {}", self.label, err);
            self.emit(EventData::for_step(TEST_ERROR).with_payload(Value::String(err.to_string())))
                .await;
        }
        let _ = self.errors_tx.send(err).await;
    }

    /// reader 主循环：分发结果、判定违约、守望 worker 落地
    async fn read_results(
        self: Arc<Self>,
        mut worker: JoinHandle<Result<Option<Value>, StepError>>,
        output_rx: async_channel::Receiver<StepResult>,
    ) {
        let mut worker_done = false;
        loop {
            tokio::select! {
                biased;
                next = output_rx.recv() => match next {
                    Ok(result) => {
                        if self.handle_result(result).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        self.set_error(RunnerError::ClosedChannels(self.label.clone()))
                            .await;
                        break;
                    }
                },
                outcome = &mut worker => {
                    worker_done = true;
                    // 先排空 worker 返回前已写入的结果
                    while let Ok(result) = output_rx.try_recv() {
                        if self.handle_result(result).await.is_err() {
                            break;
                        }
                    }
                    self.finish_worker(outcome).await;
                    break;
                }
            }
        }
        if !worker_done {
            // reader 因违约提前退出，仍要等 worker 落地才算停止
            let outcome = worker.await;
            self.finish_worker(outcome).await;
        }
        debug!("步骤 {} 的 worker 与 reader 均已退出", self.label);
        let _ = self.stopped_tx.send(true);
    }

    /// 分类并分发一条逐目标结果；Err 表示发现违约，reader 应停止
    async fn handle_result(&self, result: StepResult) -> Result<(), ()> {
        let id = result.target.id.clone();
        let waiter = {
            let mut book = self.book.lock().unwrap();
            match book.pending.remove(&id) {
                Some(tx) => {
                    book.resulted.insert(id.clone());
                    Some(tx)
                }
                None => None,
            }
        };

        let tx = match waiter {
            Some(tx) => tx,
            None => {
                let duplicated = self.book.lock().unwrap().resulted.contains(&id);
                let err = if duplicated {
                    RunnerError::DuplicateResult {
                        step: self.label.clone(),
                        target: id,
                    }
                } else {
                    RunnerError::UnexpectedResult {
                        step: self.label.clone(),
                        target: id,
                    }
                };
                self.set_error(err).await;
                return Err(());
            }
        };

        match &result.err {
            Some(e) => {
                let payload = serde_json::to_value(e).unwrap_or(Value::Null);
                self.emit(EventData::for_target(TARGET_ERR, &result.target).with_payload(payload))
                    .await;
            }
            None => {
                self.emit(EventData::for_target(TARGET_OUT, &result.target))
                    .await;
            }
        }

        if tx.send(result.err).is_err() {
            debug!("目标 {} 的驱动任务已退出，结果被丢弃", id);
        }
        Ok(())
    }

    /// 处理 worker 的落地结果
    async fn finish_worker(&self, outcome: WorkerOutcome) {
        match outcome {
            Ok(Ok(resume_state)) => {
                *self.last_resume_state.lock().unwrap() = resume_state;
                // worker 正常返回后不允许再有未出结果的目标
                let mut lost: Vec<String> = {
                    let book = self.book.lock().unwrap();
                    book.pending.keys().cloned().collect()
                };
                if !lost.is_empty() {
                    lost.sort();
                    self.set_error(RunnerError::LostTargets {
                        step: self.label.clone(),
                        targets: lost,
                    })
                    .await;
                } else if self.get_error().is_none() {
                    self.emit(EventData::for_step(TEST_STEP_FINISHED_EVENT)).await;
                }
            }
            Ok(Err(StepError::Paused { resume_state })) => {
                debug!("步骤 {} 因暂停中止", self.label);
                *self.last_resume_state.lock().unwrap() = resume_state;
                self.set_error(RunnerError::Paused).await;
            }
            Ok(Err(StepError::Failed(message))) => {
                self.set_error(RunnerError::StepFailed {
                    step: self.label.clone(),
                    message,
                })
                .await;
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    let payload = join_err.into_panic();
                    payload
                        .downcast_ref::<&'static str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "未知崩溃负载".to_string())
                } else {
                    "worker 任务被中止".to_string()
                };
                self.set_error(RunnerError::Paniced {
                    step: self.label.clone(),
                    message,
                })
                .await;
            }
        }
    }

    async fn emit(&self, data: EventData) {
        if let Err(e) = self.emitter.emit(data).await {
            warn!("步骤 {} 发出事件失败: {}", self.label, e);
        }
    }
}

/// 校验插件声明事件的发射器包装
///
/// 标准目标级事件对所有插件开放，其余事件必须在注册时声明。
struct CheckedEmitter {
    inner: Arc<dyn Emitter>,
    allowed: HashSet<String>,
}

impl CheckedEmitter {
    fn new(inner: Arc<dyn Emitter>, declared: &[String]) -> Self {
        let mut allowed: HashSet<String> = declared.iter().cloned().collect();
        for name in [TEST_STARTED_EVENT, TEST_FINISHED_EVENT, TEST_FAILED_EVENT] {
            allowed.insert(name.to_string());
        }
        Self { inner, allowed }
    }
}

#[async_trait]
impl Emitter for CheckedEmitter {
    async fn emit(&self, data: EventData) -> Result<(), EventError> {
        if !self.allowed.contains(&data.name) {
            return Err(EventError::NotAllowed(data.name.clone()));
        }
        self.inner.emit(data).await
    }
}
