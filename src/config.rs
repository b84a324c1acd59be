//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RESEARCH__*` 覆盖（双下划线表示嵌套，如 `RESEARCH__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 默认报告结构说明（注入 Planner 提示词）
pub const DEFAULT_REPORT_STRUCTURE: &str = "Each section of the learning roadmap should:
1. Focus on a specific sub-topic of the main topic
2. Include exactly 6 subsections that break down the topic logically
3. Each subsection must have:
   - A clear title
   - A brief description
   - Detailed content
   - Relevant sources";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub research: ResearchSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// [app] 段：应用名、默认请求者
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// CLI 未指定 --owner 时使用
    #[serde(default = "default_owner_id")]
    pub default_owner_id: String,
    /// 收到关闭信号后等待会话落检查点的秒数
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            default_owner_id: default_owner_id(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_owner_id() -> String {
    "local".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmDeepSeekSection,
    #[serde(default)]
    pub openai: LlmOpenAiSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    #[serde(default)]
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmDeepSeekSection::default(),
            openai: LlmOpenAiSection::default(),
            timeouts: LlmTimeoutsSection::default(),
            retry: LlmRetrySection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次补全请求超时（秒）；章节撰写输出较长，默认放宽
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    180
}

/// [llm.retry] 段：瞬时错误（网络、限流、超时）的重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmRetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// [search] 段：检索后端、超时、单条来源最大字符数
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    /// tavily / mock
    #[serde(default = "default_search_provider")]
    pub provider: String,
    /// 未设置时读取环境变量 TAVILY_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    /// 是否请求原始网页内容（HTML 会被转为纯文本）
    #[serde(default = "default_include_raw_content")]
    pub include_raw_content: bool,
    #[serde(default = "default_max_chars_per_source")]
    pub max_chars_per_source: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            provider: default_search_provider(),
            api_key: None,
            max_results: default_max_results(),
            timeout_secs: default_search_timeout_secs(),
            include_raw_content: default_include_raw_content(),
            max_chars_per_source: default_max_chars_per_source(),
        }
    }
}

fn default_search_provider() -> String {
    "tavily".to_string()
}

fn default_max_results() -> usize {
    3
}

fn default_search_timeout_secs() -> u64 {
    20
}

fn default_include_raw_content() -> bool {
    true
}

fn default_max_chars_per_source() -> usize {
    4000
}

/// [research] 段：章节数量限制与各阶段预算
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchSection {
    #[serde(default = "default_section_count")]
    pub default_section_count: usize,
    #[serde(default = "default_max_section_count")]
    pub max_section_count: usize,
    #[serde(default = "default_subsections_per_section")]
    pub subsections_per_section: usize,
    /// 每个章节最多执行的检索次数
    #[serde(default = "default_queries_per_section")]
    pub queries_per_section: usize,
    /// WriteError 后重新进入 RESEARCHING 的次数上限
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
    #[serde(default = "default_max_evidence_chars")]
    pub max_evidence_chars: usize,
    /// 规划前是否先检索一轮作为规划上下文
    #[serde(default = "default_plan_with_search")]
    pub plan_with_search: bool,
    #[serde(default = "default_report_structure")]
    pub report_structure: String,
}

impl Default for ResearchSection {
    fn default() -> Self {
        Self {
            default_section_count: default_section_count(),
            max_section_count: default_max_section_count(),
            subsections_per_section: default_subsections_per_section(),
            queries_per_section: default_queries_per_section(),
            max_write_retries: default_max_write_retries(),
            max_evidence_chars: default_max_evidence_chars(),
            plan_with_search: default_plan_with_search(),
            report_structure: default_report_structure(),
        }
    }
}

fn default_section_count() -> usize {
    6
}

fn default_max_section_count() -> usize {
    12
}

fn default_subsections_per_section() -> usize {
    6
}

fn default_queries_per_section() -> usize {
    3
}

fn default_max_write_retries() -> u32 {
    2
}

fn default_max_evidence_chars() -> usize {
    20_000
}

fn default_plan_with_search() -> bool {
    true
}

fn default_report_structure() -> String {
    DEFAULT_REPORT_STRUCTURE.to_string()
}

/// [store] 段：会话存储后端、心跳与运行时长预算
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// memory / file / sqlite（sqlite 需启用 async-sqlite feature）
    #[serde(default = "default_backend")]
    pub backend: String,
    /// file 后端为目录，sqlite 后端为数据库文件
    pub path: Option<PathBuf>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// 单次运行的墙钟预算（秒），超出后放弃当前阶段，等待下次续跑
    pub max_runtime_secs: Option<u64>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
            heartbeat_secs: default_heartbeat_secs(),
            max_runtime_secs: None,
        }
    }
}

fn default_backend() -> String {
    "file".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

/// 从 config 目录加载配置，环境变量 RESEARCH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RESEARCH__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("RESEARCH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
