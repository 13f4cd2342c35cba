//! 测试运行器主体
//!
//! 驱动任务、监控循环与收尾逻辑。结构见 crate 级文档。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use htf_common::events::EmitterFactory;
use htf_common::signal::{Signal, SignalContext};
use htf_common::{JsonError, Target};
use htf_step::Test;

use crate::errors::RunnerError;
use crate::resume::{ResumeState, TargetState, TargetStepPhase, RESUME_STATE_VERSION};
use crate::step_state::StepState;
use crate::variables::VariablesStore;

/// 默认关停超时
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// 一次运行的产出
#[derive(Debug)]
pub struct RunResult {
    /// 暂停且可恢复时的快照字节
    pub resume_state: Option<Vec<u8>>,

    /// 逐目标结果；键存在表示目标到达了终态
    pub targets_results: HashMap<String, Option<JsonError>>,

    /// 运行级错误
    pub err: Option<RunnerError>,
}

/// 测试运行器
pub struct TestRunner {
    /// 运行结束后等待各步骤退出的时限
    shutdown_timeout: Duration,
}

/// 驱动任务与监控循环共享的状态
///
/// 运行器级互斥锁保护全部目标状态，不得跨通道操作持有。
struct RunnerShared {
    steps: Vec<Arc<StepState>>,
    states: Mutex<HashMap<String, TargetState>>,
}

impl TestRunner {
    /// 使用默认关停超时创建运行器
    pub fn new() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// 指定关停超时
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// 运行一次测试
    ///
    /// 返回值里的快照只在因暂停结束且状态可恢复时非空；逐目标结果
    /// 的键存在即表示该目标到达了终态（带错误或通过）。
    pub async fn run(
        &self,
        ctx: &SignalContext,
        test: &Test,
        targets: &[Target],
        emitter_factory: Arc<dyn EmitterFactory>,
        resume_state: Option<&[u8]>,
    ) -> RunResult {
        match self
            .run_inner(ctx, test, targets, emitter_factory, resume_state)
            .await
        {
            Ok(result) => result,
            Err(err) => RunResult {
                resume_state: None,
                targets_results: HashMap::new(),
                err: Some(err),
            },
        }
    }

    async fn run_inner(
        &self,
        ctx: &SignalContext,
        test: &Test,
        targets: &[Target],
        emitter_factory: Arc<dyn EmitterFactory>,
        resume_state: Option<&[u8]>,
    ) -> Result<RunResult, RunnerError> {
        info!(
            "开始运行测试 {}：{} 个目标，{} 个步骤",
            test.name,
            targets.len(),
            test.steps.len()
        );

        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target.id.as_str()) {
                return Err(RunnerError::Internal(format!("目标 {} 重复", target.id)));
            }
        }
        let mut labels = HashSet::new();
        for bundle in &test.steps {
            if !labels.insert(bundle.label.as_str()) {
                return Err(RunnerError::Internal(format!(
                    "步骤标签 {} 重复",
                    bundle.label
                )));
            }
        }

        let run_ctx = ctx.child();

        // 解析恢复快照
        let mut restored = ResumeState {
            version: RESUME_STATE_VERSION,
            targets: HashMap::new(),
            step_resume_states: Vec::new(),
        };
        if let Some(raw) = resume_state {
            if !raw.is_empty() {
                debug!("尝试从快照恢复: {}", String::from_utf8_lossy(raw));
                restored = ResumeState::decode(raw)?;
            }
        }

        // 目标状态播种：快照里有的按快照恢复，其余从流水线起点开始
        let mut target_states = restored.targets;
        for target in targets {
            target_states
                .entry(target.id.clone())
                .or_insert_with(TargetState::new);
        }

        // 变量存储
        let variables = VariablesStore::new(&test.steps)
            .map_err(|e| RunnerError::Internal(format!("初始化步骤变量失败: {}", e)))?;
        for (id, state) in &target_states {
            variables
                .init_target(id, &state.steps_variables)
                .map_err(|e| {
                    RunnerError::Internal(format!("恢复目标 {} 的变量失败: {}", id, e))
                })?;
        }

        // 组装流水线；各步骤由驱动任务在目标到达时惰性启动
        let (errors_tx, mut errors_rx) = mpsc::channel::<RunnerError>(test.steps.len().max(1));
        let mut steps = Vec::with_capacity(test.steps.len());
        for (i, bundle) in test.steps.iter().enumerate() {
            let srs = restored.step_resume_states.get(i).cloned().flatten();

            let mut left_targets = 0;
            let mut resume_targets = Vec::new();
            for target in targets {
                let state = &target_states[&target.id];
                if state.cur_step <= i {
                    left_targets += 1;
                }
                if state.cur_step == i && state.cur_phase == TargetStepPhase::Run {
                    resume_targets.push(target.clone());
                }
            }

            let step_variables = variables
                .for_step(&bundle.label)
                .map_err(|e| RunnerError::Internal(format!("创建变量句柄失败: {}", e)))?;
            steps.push(StepState::new(
                i,
                bundle.clone(),
                emitter_factory.as_ref(),
                step_variables,
                left_targets,
                srs,
                resume_targets,
                &run_ctx,
                errors_tx.clone(),
            ));
        }

        let shared = Arc::new(RunnerShared {
            steps,
            states: Mutex::new(target_states),
        });

        // 每个目标一个驱动任务
        let (drivers_tx, mut drivers_rx) = mpsc::channel::<Option<RunnerError>>(targets.len().max(1));
        for target in targets {
            let shared = Arc::clone(&shared);
            let driver_ctx = run_ctx.clone();
            let drivers_tx = drivers_tx.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let result = drive_target(&driver_ctx, &shared, &target).await;
                if let Err(err) = &result {
                    match err {
                        RunnerError::Paused | RunnerError::Canceled => {}
                        other => error!("目标 {} 的驱动任务出错: {}", target.id, other),
                    }
                }
                let _ = drivers_tx.send(result.err()).await;
            });
        }
        drop(drivers_tx);

        // 监控循环：汇聚驱动完成情况与步骤错误；
        // 首个非暂停错误触发整体强停，之后继续排空
        let mut run_err: Option<RunnerError> = None;
        let mut remaining = targets.len();
        while remaining > 0 {
            tokio::select! {
                driver = drivers_rx.recv() => match driver {
                    Some(driver_err) => {
                        remaining -= 1;
                        if let Some(err) = driver_err {
                            record_fatal(&mut run_err, err, &shared.steps);
                        }
                    }
                    None => break,
                },
                step_err = errors_rx.recv() => {
                    if let Some(err) = step_err {
                        record_fatal(&mut run_err, err, &shared.steps);
                    }
                }
            }
        }

        // 等待步骤退出并收集各自的恢复状态
        let (step_resume_states, wait_err) = self.wait_steps(&shared.steps).await;
        if run_err.is_none() {
            run_err = wait_err;
        }

        // 不再有新结果，取消剩余的驱动与步骤
        debug!("取消剩余驱动任务");
        run_ctx.cancel();

        // 外层上下文被取消时，一切以取消为准
        if ctx.is_canceled() {
            run_err = Some(RunnerError::Canceled);
        }

        // 把运行期写入的变量同步回目标状态
        {
            let mut states = shared.states.lock().unwrap();
            for target in targets {
                if let Some(state) = states.get_mut(&target.id) {
                    state.steps_variables = variables.export_target(&target.id);
                }
            }
        }

        // 评估可恢复性：处于 run 阶段的目标必须是因为其步骤观察到
        // 暂停信号，且任何步骤都不允许持有非暂停错误
        let mut resume_ok = run_err.is_none();
        {
            let states = shared.states.lock().unwrap();
            let mut in_flight = 0;
            for target in targets {
                let state = &states[&target.id];
                let step_err = shared
                    .steps
                    .get(state.cur_step)
                    .and_then(|ss| ss.get_error());
                if state.cur_phase == TargetStepPhase::Run {
                    in_flight += 1;
                    if step_err != Some(RunnerError::Paused) {
                        resume_ok = false;
                    }
                }
                if let Some(err) = &step_err {
                    if !err.is_pause() {
                        resume_ok = false;
                    }
                }
                debug!(
                    "目标 {}：步骤 {} 阶段 {}，步骤错误 {:?}",
                    target.id, state.cur_step, state.cur_phase, step_err
                );
            }
            debug!("{} 个目标仍在步骤中，可恢复: {}", in_flight, resume_ok);
        }

        // 有错误就不再看暂停
        if let Some(err) = run_err {
            return Ok(RunResult {
                resume_state: None,
                targets_results: HashMap::new(),
                err: Some(err),
            });
        }

        // 被要求暂停时生成快照；不可恢复则丢弃快照只返回暂停哨兵
        let mut out_resume = None;
        let mut final_err = None;
        if ctx.is_paused() {
            if resume_ok {
                let snapshot = ResumeState {
                    version: RESUME_STATE_VERSION,
                    targets: shared.states.lock().unwrap().clone(),
                    step_resume_states,
                };
                let raw = snapshot.encode()?;
                debug!("恢复快照: {}", String::from_utf8_lossy(&raw));
                out_resume = Some(raw);
            } else {
                warn!("收到暂停请求，但状态不可恢复");
            }
            final_err = Some(RunnerError::Paused);
        }

        // 逐目标结果
        let mut targets_results = HashMap::new();
        {
            let states = shared.states.lock().unwrap();
            for target in targets {
                let state = &states[&target.id];
                if let Some(res) = &state.res {
                    targets_results.insert(target.id.clone(), Some(res.clone()));
                } else if !shared.steps.is_empty()
                    && state.cur_step == shared.steps.len() - 1
                    && state.cur_phase == TargetStepPhase::End
                {
                    targets_results.insert(target.id.clone(), None);
                }
            }
        }

        Ok(RunResult {
            resume_state: out_resume,
            targets_results,
            err: final_err,
        })
    }

    /// 等待每个已启动的步骤退出，超时的步骤记为 NeverReturned
    async fn wait_steps(
        &self,
        steps: &[Arc<StepState>],
    ) -> (Vec<Option<Value>>, Option<RunnerError>) {
        debug!("等待各步骤的 worker 与 reader 退出");
        let deadline = Instant::now() + self.shutdown_timeout;

        let mut never_returned = Vec::new();
        let mut result_err: Option<RunnerError> = None;
        let mut resume_states = Vec::with_capacity(steps.len());
        for ss in steps {
            if !ss.started() {
                // 未启动的步骤原样回传初始恢复状态
                resume_states.push(ss.resume_state());
                continue;
            }
            match timeout_at(deadline, ss.wait_stopped()).await {
                Ok(()) => {
                    if let Some(err) = ss.get_error() {
                        if result_err.is_none() && !err.is_pause() {
                            result_err = Some(err);
                        }
                    }
                }
                Err(_) => {
                    never_returned.push(ss.label().to_string());
                    ss.set_error(RunnerError::NeverReturned(vec![ss.label().to_string()]))
                        .await;
                    // 再次强停，帮助 reader 解除阻塞
                    ss.force_stop();
                }
            }
            resume_states.push(ss.resume_state());
        }

        if !never_returned.is_empty() && result_err.is_none() {
            result_err = Some(RunnerError::NeverReturned(never_returned));
        }
        (resume_states, result_err)
    }
}

impl Default for TestRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// 记录首个非暂停错误并强停整条流水线
fn record_fatal(run_err: &mut Option<RunnerError>, err: RunnerError, steps: &[Arc<StepState>]) {
    if err.is_pause() {
        return;
    }
    if run_err.is_some() {
        debug!("已有运行错误，后到的错误只记录: {}", err);
        return;
    }
    error!("运行出错，强停流水线: {}", err);
    *run_err = Some(err);
    for ss in steps {
        ss.force_stop();
    }
}

/// 驱动单个目标依次通过流水线
///
/// 返回前为所有剩余步骤补扣计数，保证即便目标提前退出，
/// 各步骤的输入通道也能按序关闭。
async fn drive_target(
    ctx: &SignalContext,
    shared: &RunnerShared,
    target: &Target,
) -> Result<(), RunnerError> {
    let start_step = {
        let states = shared.states.lock().unwrap();
        match states.get(&target.id) {
            Some(state) => state.cur_step,
            None => {
                return Err(RunnerError::Internal(format!(
                    "目标 {} 没有状态记录",
                    target.id
                )))
            }
        }
    };
    debug!("目标 {} 的驱动任务启动，自步骤 {} 开始", target.id, start_step);

    let mut last_decremented = start_step as isize - 1;
    let result = drive_target_steps(ctx, shared, target, start_step, &mut last_decremented).await;

    for i in ((last_decremented + 1) as usize)..shared.steps.len() {
        shared.steps[i].decrease_left_targets();
    }
    debug!("目标 {} 的驱动任务结束", target.id);
    result
}

async fn drive_target_steps(
    ctx: &SignalContext,
    shared: &RunnerShared,
    target: &Target,
    start_step: usize,
    last_decremented: &mut isize,
) -> Result<(), RunnerError> {
    let steps = &shared.steps;
    let mut i = start_step;
    while i < steps.len() {
        // 每轮先检查暂停与取消
        match ctx.signal() {
            Some(Signal::Paused) => {
                debug!("目标 {} 在步骤 {} 前暂停", target.id, i);
                return Ok(());
            }
            Some(Signal::Canceled) => {
                debug!("目标 {} 在步骤 {} 前取消", target.id, i);
                return Ok(());
            }
            None => {}
        }

        let ss = &steps[i];

        // 阶段迁移
        {
            let mut states = shared.states.lock().unwrap();
            let state = states.get_mut(&target.id).ok_or_else(|| {
                RunnerError::Internal(format!("目标 {} 没有状态记录", target.id))
            })?;
            match state.cur_phase {
                TargetStepPhase::Init => {
                    // 常规路径：注入并等待结果
                    state.cur_phase = TargetStepPhase::Begin;
                }
                TargetStepPhase::Begin => {
                    // 上次在注入前暂停，本轮重新注入
                }
                TargetStepPhase::Run => {
                    // 恢复于执行中，注入端会识别并跳过实际投递
                }
                TargetStepPhase::End => {
                    // 恢复于终态，无事可做
                    return Ok(());
                }
                other => {
                    return Err(RunnerError::Internal(format!(
                        "目标 {} 处于非法阶段 {}",
                        target.id, other
                    )));
                }
            }
        }

        // 确保步骤已启动（幂等），然后注入目标
        let mut err = ss.run().await.err();

        let mut notifier = None;
        if err.is_none() {
            debug!("目标 {} 注入步骤 {}", target.id, ss.label());
            match ss.inject_target(target).await {
                Ok(rx) => notifier = Some(rx),
                Err(e) => err = Some(e),
            }
        }

        if err.is_none() {
            let mut states = shared.states.lock().unwrap();
            if let Some(state) = states.get_mut(&target.id) {
                // 结果可能已经到达并推进了阶段，需二次确认
                if state.cur_phase == TargetStepPhase::Begin {
                    state.cur_phase = TargetStepPhase::Run;
                }
            }
        }

        ss.decrease_left_targets();
        *last_decremented = i as isize;

        // 等待本次注入的结果；暂停不打断这里的等待，
        // 步骤要么送出结果，要么以暂停错误停止
        if err.is_none() {
            if let Some(mut rx) = notifier.take() {
                tokio::select! {
                    biased;
                    res = &mut rx => match res {
                        Ok(verdict) => {
                            debug!("目标 {} 在步骤 {} 得到结果: {:?}", target.id, ss.label(), verdict);
                            let mut states = shared.states.lock().unwrap();
                            if let Some(state) = states.get_mut(&target.id) {
                                if let Some(res) = verdict {
                                    state.res = Some(res);
                                }
                                state.cur_phase = TargetStepPhase::End;
                            }
                        }
                        Err(_) => {
                            err = Some(step_stopped_error(ss));
                        }
                    },
                    _ = ss.wait_stopped() => {
                        err = Some(step_stopped_error(ss));
                        debug!("步骤 {} 已停止: {:?}", ss.label(), err);
                    }
                    _ = ctx.canceled() => {
                        debug!("目标 {} 等待结果时被取消", target.id);
                        err = Some(RunnerError::Canceled);
                    }
                }
            } else {
                err = Some(RunnerError::Internal(format!(
                    "目标 {} 在步骤 {} 没有结果通知端",
                    target.id,
                    ss.label()
                )));
            }
        }

        if let Some(err) = err {
            match &err {
                RunnerError::Paused => debug!("目标 {} 暂停", target.id),
                RunnerError::Canceled => debug!("目标 {} 取消", target.id),
                other => error!("目标 {} 的驱动失败: {}", target.id, other),
            }
            return Err(err);
        }

        // 目标失败则终止，否则推进到下一步骤
        {
            let mut states = shared.states.lock().unwrap();
            let state = states.get_mut(&target.id).ok_or_else(|| {
                RunnerError::Internal(format!("目标 {} 没有状态记录", target.id))
            })?;
            if state.res.is_some() {
                return Ok(());
            }
            i += 1;
            if i < steps.len() {
                state.cur_step = i;
                state.cur_phase = TargetStepPhase::Init;
            }
        }
    }
    Ok(())
}

/// 步骤停止后驱动任务继承的错误
fn step_stopped_error(ss: &StepState) -> RunnerError {
    ss.get_error().unwrap_or_else(|| {
        RunnerError::Internal(format!("步骤 {} 停止但未记录错误", ss.label()))
    })
}
