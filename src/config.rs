//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DAYLOOM__*` 覆盖（双下划线表示嵌套，如 `DAYLOOM__TURN__CHUNK_TIMEOUT_SECS=40`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub turn: TurnSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub proposal: ProposalSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

/// [llm] 段：OpenAI 兼容端点
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            retry: RetrySection::default(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

/// [llm.retry] 段：建立请求时的重试
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

/// [turn] 段：流读取超时与回合上限
#[derive(Debug, Clone, Deserialize)]
pub struct TurnSection {
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,
    #[serde(default = "default_orchestration_chunk_timeout")]
    pub orchestration_chunk_timeout_secs: u64,
    #[serde(default = "default_finalize_timeout")]
    pub finalize_timeout_secs: u64,
    #[serde(default = "default_orchestration_finalize_timeout")]
    pub orchestration_finalize_timeout_secs: u64,
    /// 回复短于此字符数且执行过变更工具时合成兜底确认
    #[serde(default = "default_min_answer_chars")]
    pub min_answer_chars: usize,
    /// 单个 Turn 内最多执行几轮工具（不含补救轮）
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

impl Default for TurnSection {
    fn default() -> Self {
        Self {
            chunk_timeout_secs: default_chunk_timeout(),
            orchestration_chunk_timeout_secs: default_orchestration_chunk_timeout(),
            finalize_timeout_secs: default_finalize_timeout(),
            orchestration_finalize_timeout_secs: default_orchestration_finalize_timeout(),
            min_answer_chars: default_min_answer_chars(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

fn default_chunk_timeout() -> u64 {
    30
}

fn default_orchestration_chunk_timeout() -> u64 {
    45
}

fn default_finalize_timeout() -> u64 {
    30
}

fn default_orchestration_finalize_timeout() -> u64 {
    60
}

fn default_min_answer_chars() -> usize {
    10
}

fn default_max_tool_rounds() -> usize {
    2
}

impl TurnSection {
    pub fn chunk_timeout(&self, orchestration: bool) -> Duration {
        Duration::from_secs(if orchestration {
            self.orchestration_chunk_timeout_secs
        } else {
            self.chunk_timeout_secs
        })
    }

    pub fn finalize_timeout(&self, orchestration: bool) -> Duration {
        Duration::from_secs(if orchestration {
            self.orchestration_finalize_timeout_secs
        } else {
            self.finalize_timeout_secs
        })
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [proposal] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ProposalSection {
    /// 同一天两次创建日程提案的最短间隔
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

impl Default for ProposalSection {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
        }
    }
}

fn default_min_interval_secs() -> u64 {
    5
}

/// [scheduler] 段：后台编排防抖与守卫
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_debounce_min_ms")]
    pub debounce_min_ms: u64,
    #[serde(default = "default_debounce_max_ms")]
    pub debounce_max_ms: u64,
    /// 最近一次用户消息后的静默期
    #[serde(default = "default_user_quiet_ms")]
    pub user_quiet_ms: u64,
    /// 单个任务最多延后次数，超过则放弃
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: u32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            debounce_min_ms: default_debounce_min_ms(),
            debounce_max_ms: default_debounce_max_ms(),
            user_quiet_ms: default_user_quiet_ms(),
            max_deferrals: default_max_deferrals(),
        }
    }
}

fn default_debounce_min_ms() -> u64 {
    3000
}

fn default_debounce_max_ms() -> u64 {
    6000
}

fn default_user_quiet_ms() -> u64 {
    2000
}

fn default_max_deferrals() -> u32 {
    20
}

/// 从 config 目录加载配置，环境变量 DAYLOOM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DAYLOOM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
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
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DAYLOOM")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
