//! 会话推断出的上下文：当前在查询哪个数据库，或在问知识库
//!
//! 由意图分类器从用户消息中识别，用于拼入 system 提示（引导模型选择哪一类工具）。

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Database,
    KnowledgeBase,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub kind: ContextKind,
    /// 数据库名；知识库上下文可为空
    pub name: Option<String>,
}

impl Context {
    pub fn database(name: impl Into<String>) -> Self {
        Self {
            kind: ContextKind::Database,
            name: Some(name.into()),
        }
    }

    pub fn knowledge_base() -> Self {
        Self {
            kind: ContextKind::KnowledgeBase,
            name: None,
        }
    }

    /// system 提示中的上下文段落
    pub fn to_prompt_section(&self) -> String {
        match (self.kind, &self.name) {
            (ContextKind::Database, Some(name)) => format!(
                "## Current Context\nThe user is working with the database `{name}`. \
                 Prefer the SQL and schema tools, and pass `{name}` wherever a tool asks for a database name.\n"
            ),
            (ContextKind::Database, None) => "## Current Context\nThe user is asking about a database. \
                 Prefer the SQL and schema tools.\n"
                .to_string(),
            (ContextKind::KnowledgeBase, _) => "## Current Context\nThe user is asking about documents in the knowledge base. \
                 Prefer the document search (RAG) tools and cite what you find.\n"
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_section_names_the_database() {
        let s = Context::database("sales_db").to_prompt_section();
        assert!(s.contains("`sales_db`"));
    }

    #[test]
    fn test_knowledge_base_section() {
        assert!(Context::knowledge_base().to_prompt_section().contains("knowledge base"));
    }
}
