//! 持久化层：知识库 / 状态存储，以及用户反馈队列

pub mod feedback;
pub mod knowledge;

pub use feedback::{feedback_channel, FeedbackReceiver, FeedbackSender};
pub use knowledge::{InMemoryKnowledgeStore, KnowledgeStore, SqliteKnowledgeStore};
