//! 暂停/取消信号上下文
//!
//! 以 watch 通道构成的取消树，每个节点携带一个类型化的信号原因。
//! 子节点能观察到父节点的信号；同一节点上先到的信号不会被覆盖。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

/// 运行控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// 协作式暂停，要求保留可恢复状态
    Paused,
    /// 硬取消，放弃本次运行
    Canceled,
}

/// 可克隆的信号上下文
///
/// `child` 派生的子上下文会观察父节点的信号，但子节点自身的信号
/// 不会向上传播。取消优先于暂停。
#[derive(Clone)]
pub struct SignalContext {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<Option<Signal>>,
    parent: Option<SignalContext>,
}

impl SignalContext {
    /// 创建根上下文
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(Inner { tx, parent: None }),
        }
    }

    /// 派生子上下文
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                tx,
                parent: Some(self.clone()),
            }),
        }
    }

    /// 发出暂停信号，本节点只记录首个信号
    pub fn pause(&self) {
        self.notify(Signal::Paused);
    }

    /// 发出取消信号，本节点只记录首个信号
    pub fn cancel(&self) {
        self.notify(Signal::Canceled);
    }

    fn notify(&self, signal: Signal) {
        self.inner.tx.send_if_modified(|cur| {
            if cur.is_none() {
                *cur = Some(signal);
                true
            } else {
                false
            }
        });
    }

    /// 是否已取消（含父节点）
    pub fn is_canceled(&self) -> bool {
        *self.inner.tx.borrow() == Some(Signal::Canceled)
            || self
                .inner
                .parent
                .as_ref()
                .map(|p| p.is_canceled())
                .unwrap_or(false)
    }

    /// 是否已暂停（含父节点）
    pub fn is_paused(&self) -> bool {
        *self.inner.tx.borrow() == Some(Signal::Paused)
            || self
                .inner
                .parent
                .as_ref()
                .map(|p| p.is_paused())
                .unwrap_or(false)
    }

    /// 当前生效的信号，取消优先于暂停
    pub fn signal(&self) -> Option<Signal> {
        if self.is_canceled() {
            Some(Signal::Canceled)
        } else if self.is_paused() {
            Some(Signal::Paused)
        } else {
            None
        }
    }

    /// 等待取消信号
    pub async fn canceled(&self) {
        self.wait(Signal::Canceled).await;
    }

    /// 等待暂停信号
    pub async fn paused(&self) {
        self.wait(Signal::Paused).await;
    }

    /// 等待任意信号
    pub async fn signaled(&self) -> Signal {
        tokio::select! {
            _ = self.canceled() => Signal::Canceled,
            _ = self.paused() => Signal::Paused,
        }
    }

    fn wait<'a>(&'a self, want: Signal) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut rx = self.inner.tx.subscribe();
            loop {
                let hit = match want {
                    Signal::Canceled => self.is_canceled(),
                    Signal::Paused => self.is_paused(),
                };
                if hit {
                    return;
                }
                match &self.inner.parent {
                    Some(parent) => {
                        tokio::select! {
                            res = rx.changed() => {
                                if res.is_err() {
                                    std::future::pending::<()>().await;
                                }
                            }
                            _ = parent.wait(want) => {}
                        }
                    }
                    None => {
                        if rx.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
            }
        })
    }
}

impl Default for SignalContext {
    fn default() -> Self {
        Self::new()
    }
}
