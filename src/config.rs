//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `EMCEE__*` 覆盖（双下划线表示嵌套，如 `EMCEE__SERVER__PORT=9000`）。
//! LLM 的 key / endpoint 另外兼容旧部署使用的 `ALIBABA_API_KEY`、`OPENAI_API_KEY`、`BASE_API_URL`。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// [server] 段：监听地址、连接空闲超时、等待结果的超时
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// 连接空闲超时（秒），只管 socket 存活，与单次调用超时无关
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// 连接线程等待调度结果的超时（秒）
    #[serde(default = "default_result_timeout_secs")]
    pub result_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_result_timeout_secs() -> u64 {
    290
}

fn default_max_connections() -> usize {
    1000
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            idle_timeout_secs: default_idle_timeout_secs(),
            result_timeout_secs: default_result_timeout_secs(),
            max_connections: default_max_connections(),
        }
    }
}

impl ServerSection {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// [llm] 段：OpenAI 兼容端点、模型与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_model() -> String {
    "qwen-plus".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: default_model(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

impl LlmSection {
    /// 配置优先，其次 BASE_API_URL
    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| std::env::var("BASE_API_URL").ok())
            .filter(|s| !s.trim().is_empty())
    }

    /// 配置优先，其次 ALIBABA_API_KEY / OPENAI_API_KEY
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| std::env::var("ALIBABA_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_completion_timeout")]
    pub completion_secs: u64,
}

fn default_completion_timeout() -> u64 {
    30
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            completion_secs: default_completion_timeout(),
        }
    }
}

/// [provider] 段：工具服务进程（stdio）启动参数与重试节奏
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSection {
    /// 启动命令，如 python
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub connect_backoff_ms: u64,
    /// 三类能力全为空时的轮询次数（服务可能仍在启动）
    #[serde(default = "default_empty_list_polls")]
    pub empty_list_polls: u32,
    #[serde(default = "default_backoff_ms")]
    pub empty_list_backoff_ms: u64,
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
    /// 单个 JSON-RPC 请求（含 initialize）的超时
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_empty_list_polls() -> u32 {
    5
}

fn default_list_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    20
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            workdir: None,
            env: HashMap::new(),
            connect_attempts: default_connect_attempts(),
            connect_backoff_ms: default_backoff_ms(),
            empty_list_polls: default_empty_list_polls(),
            empty_list_backoff_ms: default_backoff_ms(),
            list_timeout_secs: default_list_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ProviderSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            connect_attempts: self.connect_attempts.max(1),
            connect_backoff: Duration::from_millis(self.connect_backoff_ms),
            empty_list_polls: self.empty_list_polls,
            empty_list_backoff: Duration::from_millis(self.empty_list_backoff_ms),
            list_timeout: Duration::from_secs(self.list_timeout_secs),
        }
    }
}

/// 建连与能力列举的重试节奏（由 ProviderSection 推导）
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub empty_list_polls: u32,
    pub empty_list_backoff: Duration,
    pub list_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        ProviderSection::default().retry_policy()
    }
}

/// [tools] 段：单次工具超时、扇出并发上限、工具族匹配规则
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// 单轮扇出的并发上限
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// 名称包含其一即视为「取数」工具
    #[serde(default = "default_data_tool_patterns")]
    pub data_tool_patterns: Vec<String>,
    /// 名称包含其一即视为「画图」工具（先于取数规则匹配）
    #[serde(default = "default_chart_tool_patterns")]
    pub chart_tool_patterns: Vec<String>,
    /// 用户消息包含其一即视为画图意图
    #[serde(default = "default_chart_keywords")]
    pub chart_keywords: Vec<String>,
}

fn default_call_timeout_secs() -> u64 {
    15
}

fn default_max_concurrent_calls() -> usize {
    4
}

fn default_data_tool_patterns() -> Vec<String> {
    vec![
        "sql".into(),
        "query".into(),
        "schema".into(),
        "rag".into(),
        "search".into(),
    ]
}

fn default_chart_tool_patterns() -> Vec<String> {
    vec!["create_chart".into(), "chart_create".into()]
}

fn default_chart_keywords() -> Vec<String> {
    vec![
        "vẽ biểu đồ".into(),
        "biểu đồ".into(),
        "chart".into(),
        "graph".into(),
    ]
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            max_concurrent_calls: default_max_concurrent_calls(),
            data_tool_patterns: default_data_tool_patterns(),
            chart_tool_patterns: default_chart_tool_patterns(),
            chart_keywords: default_chart_keywords(),
        }
    }
}

/// [session] 段：历史窗口、迭代上限、工作队列容量
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// 送入 LLM 的历史条数上限
    #[serde(default = "default_max_history_length")]
    pub max_history_length: usize,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_max_history_length() -> usize {
    20
}

fn default_max_iterations() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_history_length: default_max_history_length(),
            max_iterations: default_max_iterations(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// 启动期致命错误：缺少必需配置
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl AppConfig {
    /// 检查必需项；缺失时进程不应启动
    pub fn validate(&self) -> Result<(), StartupError> {
        let mut missing = Vec::new();
        if self.llm.resolved_base_url().is_none() {
            missing.push("llm.base_url (or BASE_API_URL)");
        }
        if self.llm.resolved_api_key().is_none() {
            missing.push("llm.api_key (or ALIBABA_API_KEY / OPENAI_API_KEY)");
        }
        if self.provider.command.trim().is_empty() {
            missing.push("provider.command");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StartupError::Missing(missing.join(", ")))
        }
    }
}

/// 从 config 目录加载配置，环境变量 EMCEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 EMCEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, StartupError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("EMCEE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("provider.args")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}
