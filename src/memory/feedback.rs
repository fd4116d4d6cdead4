//! 用户反馈通道
//!
//! 控制面（CLI / HTTP 的 feedback、user_input）通过 FeedbackSender 入队，
//! 编排循环在每次 executing_plan 迭代开始时 drain，按 FIFO 顺序写入 AgentState。
//! 通道有界；队列满时 send 等待空位，try_send 直接拒绝，消息不会被静默丢弃。

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::core::state::AgentState;
use crate::core::AgentError;

/// 创建一对反馈通道端点
pub fn feedback_channel(capacity: usize) -> (FeedbackSender, FeedbackReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FeedbackSender { tx },
        FeedbackReceiver {
            rx: Mutex::new(rx),
        },
    )
}

/// 生产端，可克隆给多个控制面
#[derive(Debug, Clone)]
pub struct FeedbackSender {
    tx: mpsc::Sender<String>,
}

impl FeedbackSender {
    pub async fn send(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.tx
            .send(text.into())
            .await
            .map_err(|_| AgentError::FeedbackRejected("feedback channel closed".to_string()))
    }

    pub fn try_send(&self, text: impl Into<String>) -> Result<(), AgentError> {
        self.tx.try_send(text.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                AgentError::FeedbackRejected("feedback queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                AgentError::FeedbackRejected("feedback channel closed".to_string())
            }
        })
    }
}

/// 消费端，由编排循环在迭代开始时读取
#[derive(Debug)]
pub struct FeedbackReceiver {
    rx: Mutex<mpsc::Receiver<String>>,
}

impl FeedbackReceiver {
    /// 取出当前已排队的全部消息（不等待）
    pub fn drain(&self) -> Vec<String> {
        let mut rx = match self.rx.lock() {
            Ok(rx) => rx,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// drain 并写入状态：每条消息依次成为 last_feedback；有待回答的问题时视为其答案并清除
    pub fn absorb_into(&self, state: &mut AgentState) -> Vec<String> {
        let messages = self.drain();
        for msg in &messages {
            tracing::info!(feedback = %msg, "Processing user feedback");
            if let Some(question) = state.pending_user_question.take() {
                tracing::info!(question = %question, "Pending question answered");
            }
            state.last_feedback = Some(msg.clone());
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_from_many_producers() {
        let (tx, rx) = feedback_channel(16);
        let tx2 = tx.clone();
        tx.send("first").await.unwrap();
        tx2.send("second").await.unwrap();
        tx.try_send("third").unwrap();
        assert_eq!(rx.drain(), vec!["first", "second", "third"]);
        assert!(rx.drain().is_empty());
    }

    #[tokio::test]
    async fn test_absorb_answers_pending_question() {
        let (tx, rx) = feedback_channel(4);
        let mut state = AgentState::default();
        state.pending_user_question = Some("Which file?".to_string());
        tx.send("notes.txt").await.unwrap();
        tx.send("actually todo.txt").await.unwrap();

        let consumed = rx.absorb_into(&mut state);
        assert_eq!(consumed.len(), 2);
        assert!(state.pending_user_question.is_none());
        assert_eq!(state.last_feedback.as_deref(), Some("actually todo.txt"));
    }

    #[test]
    fn test_try_send_rejects_when_full() {
        let (tx, _rx) = feedback_channel(1);
        tx.try_send("a").unwrap();
        assert!(tx.try_send("b").is_err());
    }
}
