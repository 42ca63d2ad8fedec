//! 工具调用顺序约束：画图工具必须在同一请求内某个取数工具成功之后才能调用
//!
//! 按名称子串归类（大小写不敏感），画图规则先于取数规则匹配（`create_chart_from_query` 属于画图）。
//! 被拒绝的调用以错误结果回给模型，循环继续，模型可以先取数再重试。

use crate::config::ToolsSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFamily {
    Data,
    Chart,
    Other,
}

/// 归类规则（来自配置）
#[derive(Debug, Clone)]
pub struct OrderingPolicy {
    data_patterns: Vec<String>,
    chart_patterns: Vec<String>,
}

impl OrderingPolicy {
    pub fn new(data_patterns: Vec<String>, chart_patterns: Vec<String>) -> Self {
        let lower = |v: Vec<String>| -> Vec<String> { v.into_iter().map(|p| p.to_lowercase()).collect() };
        Self {
            data_patterns: lower(data_patterns),
            chart_patterns: lower(chart_patterns),
        }
    }

    pub fn from_config(tools: &ToolsSection) -> Self {
        Self::new(tools.data_tool_patterns.clone(), tools.chart_tool_patterns.clone())
    }

    pub fn classify(&self, tool_name: &str) -> ToolFamily {
        let name = tool_name.to_lowercase();
        if self.chart_patterns.iter().any(|p| name.contains(p.as_str())) {
            ToolFamily::Chart
        } else if self.data_patterns.iter().any(|p| name.contains(p.as_str())) {
            ToolFamily::Data
        } else {
            ToolFamily::Other
        }
    }

    /// 每个请求一个新的守卫
    pub fn guard(&self) -> OrderingGuard<'_> {
        OrderingGuard {
            policy: self,
            data_ready: false,
        }
    }
}

impl Default for OrderingPolicy {
    fn default() -> Self {
        Self::from_config(&ToolsSection::default())
    }
}

/// 单个请求内的顺序状态
pub struct OrderingGuard<'a> {
    policy: &'a OrderingPolicy,
    data_ready: bool,
}

impl OrderingGuard<'_> {
    /// 检查是否允许调用；拒绝时返回给模型的说明
    pub fn check(&self, tool_name: &str) -> Result<(), String> {
        if self.policy.classify(tool_name) == ToolFamily::Chart && !self.data_ready {
            return Err(format!(
                "Tool '{}' needs data: call a data retrieval tool (SQL query, schema lookup or search) first, \
                 wait for its result, then pass that data to the chart tool",
                tool_name
            ));
        }
        Ok(())
    }

    /// 记录一次调用结果；成功的取数调用解锁画图
    pub fn record(&mut self, tool_name: &str, succeeded: bool) {
        if succeeded && self.policy.classify(tool_name) == ToolFamily::Data {
            self.data_ready = true;
        }
    }

    pub fn data_ready(&self) -> bool {
        self.data_ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_patterns_win() {
        let policy = OrderingPolicy::default();
        assert_eq!(policy.classify("create_chart_from_query"), ToolFamily::Chart);
        assert_eq!(policy.classify("chart_create_bar"), ToolFamily::Chart);
        assert_eq!(policy.classify("sql_query_db"), ToolFamily::Data);
        assert_eq!(policy.classify("rag_search"), ToolFamily::Data);
        assert_eq!(policy.classify("get_time"), ToolFamily::Other);
    }

    #[test]
    fn test_chart_requires_successful_data_call() {
        let policy = OrderingPolicy::default();
        let mut guard = policy.guard();
        assert!(guard.check("create_chart").is_err());

        guard.record("sql_query_db", false);
        assert!(guard.check("create_chart").is_err());

        guard.record("get_time", true);
        assert!(guard.check("create_chart").is_err());

        guard.record("sql_query_db", true);
        assert!(guard.check("create_chart").is_ok());
    }

    #[test]
    fn test_other_tools_are_never_blocked() {
        let policy = OrderingPolicy::default();
        assert!(policy.guard().check("list_databases").is_ok());
    }
}
