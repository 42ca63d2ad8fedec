//! 意图识别模块
//!
//! 从用户消息中推断会话上下文（在查哪个数据库 / 在问知识库）以及是否要画图。
//! 默认实现是正则与关键词规则，天然不精确：只在消息里有明确信号时给出结果，否则返回 None 让会话沿用原上下文。

use regex::Regex;
use tracing::warn;

use crate::config::ToolsSection;
use crate::memory::Context;

/// 可替换的上下文分类器
pub trait ContextClassifier: Send + Sync {
    /// 消息中有明确信号时返回新上下文
    fn classify(&self, message: &str) -> Option<Context>;

    /// 是否为画图请求
    fn wants_chart(&self, _message: &str) -> bool {
        false
    }
}

/// 被误捕获为库名的常见词
const NAME_STOPWORDS: &[&str] = &[
    "is", "are", "the", "a", "an", "of", "for", "to", "in", "on", "and", "or", "with", "name", "names", "list",
    "server", "schema", "table", "tables", "nao", "nay",
];

const KNOWLEDGE_BASE_KEYWORDS: &[&str] = &[
    "tài liệu",
    "văn bản",
    "cơ sở tri thức",
    "knowledge base",
    "document",
    "pdf",
];

/// 基于正则与关键词的默认分类器
pub struct RegexContextClassifier {
    database: Option<Regex>,
    chart_keywords: Vec<String>,
}

impl RegexContextClassifier {
    pub fn new(chart_keywords: Vec<String>) -> Self {
        Self {
            database: Self::database_pattern(),
            chart_keywords: chart_keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn from_config(tools: &ToolsSection) -> Self {
        Self::new(tools.chart_keywords.clone())
    }

    fn database_pattern() -> Option<Regex> {
        Regex::new(
            r#"(?i)\b(?:database|db|cơ sở dữ liệu|csdl)(?:\s*[:=]\s*|\s+)['"`]?([A-Za-z0-9_][A-Za-z0-9_\-.]*[A-Za-z0-9_])\b"#,
        )
        .map_err(|e| warn!(error = %e, "Database name pattern failed to compile, database context disabled"))
        .ok()
    }

    fn database_name(&self, message: &str) -> Option<String> {
        self.database
            .as_ref()?
            .captures_iter(message)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .find(|name| !NAME_STOPWORDS.contains(&name.to_lowercase().as_str()))
    }
}

impl Default for RegexContextClassifier {
    fn default() -> Self {
        Self::from_config(&ToolsSection::default())
    }
}

impl ContextClassifier for RegexContextClassifier {
    fn classify(&self, message: &str) -> Option<Context> {
        if let Some(name) = self.database_name(message) {
            return Some(Context::database(name));
        }
        let lower = message.to_lowercase();
        if KNOWLEDGE_BASE_KEYWORDS.iter().any(|k| lower.contains(k)) {
            return Some(Context::knowledge_base());
        }
        None
    }

    fn wants_chart(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.chart_keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}
