//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / effect / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时、捕获错误与 panic，统一转为模型可见的结果。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolSpec;
use crate::tools::catalog::{ToolEffect, ToolOutcome};

/// 工具 trait：名称、描述（仅供模型理解，不做强制）、参数 schema、副作用类别、异步执行（args 为原始 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称
    fn name(&self) -> &str;

    /// 工具描述
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    /// 默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 默认只读
    fn effect(&self) -> ToolEffect {
        ToolEffect::ReadOnly
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutcome>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>（有序，声明顺序稳定）
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn effect_of(&self, name: &str) -> Option<ToolEffect> {
        self.tools.get(name).map(|t| t.effect())
    }

    /// 向模型声明的工具列表
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}
