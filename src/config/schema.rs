use anyhow::{bail, Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::LarkError;

const FEISHU_BASE_URL: &str = "https://open.feishu.cn/open-apis";
const LARK_BASE_URL: &str = "https://open.larksuite.com/open-apis";

pub const ENV_APP_ID: &str = "LARK_APP_ID";
pub const ENV_APP_SECRET: &str = "LARK_APP_SECRET";
pub const ENV_APP_TOKEN: &str = "LARK_APP_TOKEN";

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_token_refresh_margin_secs() -> u64 {
    120
}

fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_page_size() -> u32 {
    500
}

fn default_timezone() -> String {
    "Asia/Shanghai".into()
}

fn default_display_limit() -> usize {
    5
}

fn default_log_level() -> String {
    "info".into()
}

fn default_attachment_field() -> String {
    "输出文件".into()
}

/// Top-level `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub lark: LarkConfig,
    #[serde(default)]
    pub bitable: BitableConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lark: LarkConfig::default(),
            bitable: BitableConfig::default(),
            notify: NotifyConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// App credentials and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LarkConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    /// Route to Feishu (China) endpoints instead of Lark international.
    #[serde(default = "default_true")]
    pub use_feishu: bool,
    /// Explicit API base, overrides `use_feishu` (tests, proxies).
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Refresh the tenant token this many seconds before the announced expiry.
    #[serde(default = "default_token_refresh_margin_secs")]
    pub token_refresh_margin_secs: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_true() -> bool {
    true
}

impl Default for LarkConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            use_feishu: true,
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
            token_refresh_margin_secs: default_token_refresh_margin_secs(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl LarkConfig {
    pub fn api_base(&self) -> String {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ if self.use_feishu => FEISHU_BASE_URL.to_string(),
            _ => LARK_BASE_URL.to_string(),
        }
    }

    /// Credentials, or `CredentialMissing` naming the first absent one.
    pub fn credentials(&self) -> Result<Credentials, LarkError> {
        if self.app_id.trim().is_empty() {
            return Err(LarkError::CredentialMissing(ENV_APP_ID));
        }
        if self.app_secret.trim().is_empty() {
            return Err(LarkError::CredentialMissing(ENV_APP_SECRET));
        }
        Ok(Credentials {
            app_id: self.app_id.trim().to_string(),
            app_secret: self.app_secret.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub app_id: String,
    pub app_secret: String,
}

/// Default Bitable app and paging.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BitableConfig {
    #[serde(default)]
    pub app_token: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Attachment field written by `upload`.
    #[serde(default = "default_attachment_field")]
    pub attachment_field: String,
}

impl Default for BitableConfig {
    fn default() -> Self {
        Self {
            app_token: String::new(),
            page_size: default_page_size(),
            attachment_field: default_attachment_field(),
        }
    }
}

/// Deadline notification job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NotifyConfig {
    #[serde(default)]
    pub tasks_table: String,
    #[serde(default)]
    pub members_table: String,
    #[serde(default)]
    pub projects_table: String,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    /// IANA zone that defines "today at midnight".
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_display_limit")]
    pub display_limit: usize,
    #[serde(default)]
    pub fields: TaskFieldNames,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            tasks_table: String::new(),
            members_table: String::new(),
            projects_table: String::new(),
            dashboard_url: None,
            timezone: default_timezone(),
            display_limit: default_display_limit(),
            fields: TaskFieldNames::default(),
        }
    }
}

impl NotifyConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .trim()
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("notify.timezone is not a valid IANA zone: {e}"))
    }
}

/// Bitable column names and status values read by the notification engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TaskFieldNames {
    pub task_name: String,
    pub status: String,
    pub assignee: String,
    pub due_date: String,
    pub priority: String,
    pub project: String,
    pub project_name: String,
    pub member_name: String,
    pub member_user: String,
    pub status_completed: String,
    pub status_in_progress: String,
    pub status_pending: String,
    pub default_priority: String,
}

impl Default for TaskFieldNames {
    fn default() -> Self {
        Self {
            task_name: "任务名称".into(),
            status: "状态".into(),
            assignee: "负责人".into(),
            due_date: "截止日期".into(),
            priority: "优先级".into(),
            project: "所属项目".into(),
            project_name: "项目名称".into(),
            member_name: "姓名".into(),
            member_user: "飞书用户".into(),
            status_completed: "已完成".into(),
            status_in_progress: "进行中".into(),
            status_pending: "待开始".into(),
            default_priority: "P2".into(),
        }
    }
}

impl Config {
    /// Default location: `<config dir>/larkgate/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "larkgate")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Parse a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse {} as TOML", path.display()))?;
        Ok(config)
    }

    /// Load, apply environment overrides, validate.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(id) = non_empty(ENV_APP_ID) {
            self.lark.app_id = id;
        }
        if let Some(secret) = non_empty(ENV_APP_SECRET) {
            self.lark.app_secret = secret;
        }
        if let Some(app_token) = non_empty(ENV_APP_TOKEN) {
            self.bitable.app_token = app_token;
        }
    }

    /// Structural checks only; credentials are checked lazily by the commands that need them.
    pub fn validate(&self) -> Result<()> {
        if self.lark.request_timeout_secs == 0 {
            bail!("lark.request_timeout_secs must be > 0");
        }
        if self.lark.max_upload_bytes == 0 {
            bail!("lark.max_upload_bytes must be > 0");
        }
        if self.bitable.page_size == 0 || self.bitable.page_size > 500 {
            bail!("bitable.page_size must be within 1..=500");
        }
        if self.notify.display_limit == 0 {
            bail!("notify.display_limit must be > 0");
        }
        self.notify.tz()?;
        if self.log_level.trim().is_empty() {
            bail!("log_level must not be empty");
        }
        Ok(())
    }

    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(Config)).unwrap_or_default()
    }
}
