//! 工具注册表
//!
//! 把工具服务的三类能力（tools / resources / resource templates）合并为一张「函数名 → ToolDescriptor」表，
//! 同时生成交给 LLM 的 function schema 列表。refresh 先完整构建新快照再整体替换，
//! 在途调用持有的旧快照保持有效，读者永远看不到半成品。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::RetryPolicy;
use crate::tools::descriptor::{InvocationKind, ToolDescriptor};
use crate::tools::provider::{list_capabilities, CapabilityListing, ProviderError, ToolProvider};
use crate::tools::template::{argument_schema, split_param_hints, UriTemplate};

/// OpenAI 函数名长度上限
const MAX_FUNCTION_NAME_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Deserialize)]
struct ToolMeta {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResourceMeta {
    uri: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TemplateMeta {
    #[serde(rename = "uriTemplate")]
    uri_template: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// 转为合法的函数名：仅保留字母数字、`_`、`-`，其余替换为 `_`
pub fn function_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('_');
    let name: String = trimmed.chars().take(MAX_FUNCTION_NAME_LEN).collect();
    if name.is_empty() {
        "unnamed".to_string()
    } else {
        name
    }
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// 某一时刻的完整注册表（不可变）
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    by_name: HashMap<String, ToolDescriptor>,
    schemas: Vec<Value>,
}

impl RegistrySnapshot {
    /// 由原始能力列表构建；坏条目与重名条目被丢弃并记录
    pub fn build(listing: &CapabilityListing) -> Self {
        let mut snapshot = Self::default();

        for raw in &listing.tools {
            match serde_json::from_value::<ToolMeta>(raw.clone()) {
                Ok(meta) => snapshot.insert(ToolDescriptor {
                    name: function_name(&meta.name),
                    target: meta.name,
                    kind: InvocationKind::Tool,
                    argument_schema: meta
                        .input_schema
                        .filter(Value::is_object)
                        .unwrap_or_else(empty_object_schema),
                    description: meta.description.unwrap_or_default(),
                }),
                Err(e) => warn!(entry = %raw, error = %e, "Dropping tool with invalid metadata"),
            }
        }

        for raw in &listing.resources {
            match serde_json::from_value::<ResourceMeta>(raw.clone()) {
                Ok(meta) => {
                    let description = meta
                        .description
                        .or(meta.name)
                        .unwrap_or_else(|| format!("Read resource {}", meta.uri));
                    snapshot.insert(ToolDescriptor {
                        name: function_name(&meta.uri),
                        target: meta.uri,
                        kind: InvocationKind::Resource,
                        argument_schema: empty_object_schema(),
                        description,
                    })
                }
                Err(e) => warn!(entry = %raw, error = %e, "Dropping resource with invalid metadata"),
            }
        }

        for raw in &listing.resource_templates {
            let meta = match serde_json::from_value::<TemplateMeta>(raw.clone()) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(entry = %raw, error = %e, "Dropping resource template with invalid metadata");
                    continue;
                }
            };
            let template = match UriTemplate::parse(&meta.uri_template) {
                Ok(t) => t,
                Err(e) => {
                    warn!(template = %meta.uri_template, error = %e, "Dropping unparsable resource template");
                    continue;
                }
            };
            let (text, hints) = split_param_hints(meta.description.as_deref().unwrap_or_default());
            let description = if text.is_empty() {
                meta.name.unwrap_or_else(|| format!("Read resource {}", meta.uri_template))
            } else {
                text
            };
            snapshot.insert(ToolDescriptor {
                name: function_name(&meta.uri_template),
                argument_schema: argument_schema(&template, &hints),
                target: meta.uri_template,
                kind: InvocationKind::ResourceTemplate,
                description,
            });
        }

        snapshot
    }

    fn insert(&mut self, descriptor: ToolDescriptor) {
        if let Some(existing) = self.by_name.get(&descriptor.name) {
            error!(
                name = %descriptor.name,
                kept = %existing.target,
                dropped = %descriptor.target,
                "Capability name collision, dropping later entry"
            );
            return;
        }
        self.schemas.push(descriptor.to_function_schema());
        self.by_name.insert(descriptor.name.clone(), descriptor);
    }

    pub fn resolve(&self, name: &str) -> Option<&ToolDescriptor> {
        self.by_name.get(name)
    }

    pub fn kind(&self, name: &str) -> Option<InvocationKind> {
        self.by_name.get(name).map(|d| d.kind)
    }

    /// 交给 LLM 的 function schema 列表（保持列举顺序）
    pub fn schemas(&self) -> &[Value] {
        &self.schemas
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// 注册表：持有当前快照，refresh 时整体替换
#[derive(Debug, Default)]
pub struct ToolRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// 重新列举能力并原子替换；服务不可达时返回错误，旧快照保持不变
    pub async fn refresh(
        &self,
        provider: &dyn ToolProvider,
        policy: &RetryPolicy,
    ) -> Result<Arc<RegistrySnapshot>, RegistryError> {
        let listing = list_capabilities(provider, policy).await?;
        let snapshot = Arc::new(RegistrySnapshot::build(&listing));
        info!(
            tools = listing.tools.len(),
            resources = listing.resources.len(),
            resource_templates = listing.resource_templates.len(),
            registered = snapshot.len(),
            "Tool registry refreshed"
        );
        *self.current.write().await = Arc::clone(&snapshot);
        Ok(snapshot)
    }

    pub async fn resolve(&self, name: &str) -> Result<ToolDescriptor, RegistryError> {
        self.snapshot()
            .await
            .resolve(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }
}
