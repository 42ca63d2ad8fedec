//! 会话存储
//!
//! 只由调度器任务持有与修改（单写者），因此是普通的 HashMap，不加锁；
//! 连接线程需要读取会话状态（stats、clear_history）时必须经由桥提交作业，不能直接引用。

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::memory::{Context, Message};

/// 单个会话：消息历史 + 推断出的上下文
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub id: String,
    pub messages: Vec<Message>,
    pub context: Option<Context>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            context: None,
            created_at: now,
            last_active: now,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.last_active = Utc::now();
    }

    /// 上下文切换时清空历史（上下文由调用方设置）
    pub fn reset_history(&mut self) {
        self.messages.clear();
    }

    /// 回滚到指定长度（失败的一轮不留下半截工具往返）
    pub fn rollback_to(&mut self, len: usize) {
        self.messages.truncate(len);
    }
}

/// 所有会话，按会话 id 索引；进程内存活，不持久化
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<String, ConversationSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 首次出现的 id 懒创建
    pub fn get_or_create(&mut self, id: &str) -> &mut ConversationSession {
        self.sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::debug!(conversation_id = %id, "Creating conversation session");
                ConversationSession::new(id)
            })
    }

    pub fn get(&self, id: &str) -> Option<&ConversationSession> {
        self.sessions.get(id)
    }

    /// 管理命令：清除会话历史与上下文；会话不存在时返回 false
    pub fn clear(&mut self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// 所有会话的消息总数
    pub fn total_messages(&self) -> usize {
        self.sessions.values().map(|s| s.messages.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_creation_and_counts() {
        let mut store = SessionStore::new();
        store.get_or_create("c1").push(Message::user("hi"));
        store.get_or_create("c1").push(Message::assistant("hello"));
        store.get_or_create("c2").push(Message::user("yo"));
        assert_eq!(store.active_count(), 2);
        assert_eq!(store.total_messages(), 3);
        assert_eq!(store.get("c1").unwrap().messages.len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut store = SessionStore::new();
        store.get_or_create("c1").push(Message::user("hi"));
        assert!(store.clear("c1"));
        assert!(!store.clear("c1"));
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn test_rollback() {
        let mut s = ConversationSession::new("c");
        s.push(Message::user("q"));
        let mark = s.messages.len();
        s.push(Message::assistant("partial"));
        s.rollback_to(mark);
        assert_eq!(s.messages, vec![Message::user("q")]);
    }
}
