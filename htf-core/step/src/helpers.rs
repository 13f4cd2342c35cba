//! 步骤插件常用工具

use std::future::Future;

use htf_common::signal::SignalContext;
use htf_common::JsonError;
use htf_common::Target;

use crate::step::{StepError, StepResult, TestStepChannels};

/// 对每个注入的目标并发执行处理函数
///
/// 为每个目标派生一个任务，任务结束后把判定写回输出通道；
/// 上下文取消后未完成的目标不再产出结果。输入关闭或取消后
/// 等待所有已派生任务退出再返回。
pub async fn for_each_target<F, Fut>(
    ctx: &SignalContext,
    channels: &TestStepChannels,
    handler: F,
) -> Result<(), StepError>
where
    F: Fn(SignalContext, Target) -> Fut,
    Fut: Future<Output = Option<JsonError>> + Send + 'static,
{
    let mut tasks = Vec::new();
    loop {
        tokio::select! {
            next = channels.inp.recv() => match next {
                Some(target) => {
                    let out = channels.out.clone();
                    let task_ctx = ctx.clone();
                    let fut = handler(task_ctx.clone(), target.clone());
                    tasks.push(tokio::spawn(async move {
                        tokio::select! {
                            err = fut => {
                                let _ = out.send(StepResult { target, err }).await;
                            }
                            _ = task_ctx.canceled() => {}
                        }
                    }));
                }
                None => break,
            },
            _ = ctx.canceled() => break,
        }
    }

    for task in tasks {
        if task.await.is_err() {
            return Err(StepError::Failed("目标处理任务异常退出".to_string()));
        }
    }
    Ok(())
}
