//! 工具层：工具服务连接（MCP stdio / Mock）、注册表、URI 模板与执行器

pub mod descriptor;
pub mod executor;
pub mod mcp;
pub mod mock;
pub mod provider;
pub mod registry;
pub mod template;

pub use descriptor::{Artifact, InvocationKind, ToolCallRequest, ToolCallResult, ToolDescriptor};
pub use executor::{PlannedCall, ToolExecutor};
pub use mcp::{McpStdioConnector, McpStdioProvider};
pub use mock::{MockBehaviour, MockConnector, MockInvocation, MockToolProvider};
pub use provider::{
    connect_with_retry, fast_retry_policy, invoke, list_capabilities, CapabilityListing, ProviderConnector,
    ProviderError, ProviderHandle, ToolProvider,
};
pub use registry::{RegistryError, RegistrySnapshot, ToolRegistry};
pub use template::{ParamHint, UriTemplate};
