//! 会话监管：取消令牌的生命周期
//!
//! 每次 run 开始时换发新的 CancellationToken；cancel() 置位后，编排循环在每个阶段边界轮询到即转 aborted。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 会话级取消管理：当前 run 的令牌
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    cancel_token: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前令牌的克隆（交给 run worker）
    pub fn cancel_token(&self) -> CancellationToken {
        match self.cancel_token.lock() {
            Ok(t) => t.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 为新的 run 换发令牌，旧令牌保持原状
    pub fn renew(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        match self.cancel_token.lock() {
            Ok(mut t) => *t = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        fresh
    }

    /// 触发取消（stop / kill）
    pub fn cancel(&self) {
        self.cancel_token().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token().is_cancelled()
    }
}
