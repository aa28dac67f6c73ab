//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SWITCHBOARD__*` 覆盖（双下划线表示嵌套，如 `SWITCHBOARD__POOL__SIZE=4`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::BackoffPolicy;
use crate::gateway::AgentSettings;
use crate::worker::{PoolSettings, DEFAULT_AGENT};

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub dispatcher: DispatcherConfig,
    pub agent: AgentConfig,
    pub gateway: GatewayConfig,
}

impl AppConfig {
    /// 校验超时分层：rpc < worker 响应 < 健康检查间隔，且网关等待回复的时间覆盖 worker 响应
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate(self.dispatcher.rpc_timeout_secs)?;
        let worker_bound = self.pool.response_timeout_secs + self.pool.response_margin_secs;
        if self.gateway.reply_timeout_secs <= worker_bound {
            return Err(ConfigError::Invalid(format!(
                "gateway.reply_timeout_secs ({}) must exceed pool response timeout plus margin ({})",
                self.gateway.reply_timeout_secs, worker_bound
            )));
        }
        Ok(())
    }
}

/// `[pool]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    pub response_timeout_secs: u64,
    pub response_margin_secs: u64,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub max_restarts: u32,
    pub restart_cooldown_secs: u64,
    pub shutdown_grace_secs: u64,
    pub backoff: BackoffConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            response_timeout_secs: 120,
            response_margin_secs: 5,
            health_check_interval_secs: 180,
            health_check_timeout_secs: 10,
            max_restarts: 5,
            restart_cooldown_secs: 60,
            shutdown_grace_secs: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self, rpc_timeout_secs: u64) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be at least 1".into()));
        }
        if rpc_timeout_secs >= self.response_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "dispatcher.rpc_timeout_secs ({}) must be less than pool.response_timeout_secs ({})",
                rpc_timeout_secs, self.response_timeout_secs
            )));
        }
        if self.response_timeout_secs >= self.health_check_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "pool.response_timeout_secs ({}) must be less than pool.health_check_interval_secs ({})",
                self.response_timeout_secs, self.health_check_interval_secs
            )));
        }
        if self.health_check_timeout_secs == 0 {
            return Err(ConfigError::Invalid("pool.health_check_timeout_secs must be positive".into()));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid("pool.backoff.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }

    pub fn to_settings(&self) -> PoolSettings {
        PoolSettings {
            size: self.size,
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            response_margin: Duration::from_secs(self.response_margin_secs),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            health_check_timeout: Duration::from_secs(self.health_check_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            restart_policy: BackoffPolicy {
                initial_delay: Duration::from_millis(self.backoff.initial_ms),
                multiplier: self.backoff.multiplier,
                max_delay: Duration::from_millis(self.backoff.max_ms),
                max_attempts: self.max_restarts,
                reset_after: Duration::from_secs(self.restart_cooldown_secs),
            },
        }
    }
}

/// `[pool.backoff]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            multiplier: 2.0,
            max_ms: 30_000,
        }
    }
}

/// `[dispatcher]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub rpc_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { rpc_timeout_secs: 30 }
    }
}

impl DispatcherConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Agent 在哪里执行
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    #[default]
    Embedded,
    Worker,
}

/// `[agent]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub process_mode: ProcessMode,
    /// 0 = 不唤醒
    pub wake_interval_secs: u64,
    pub wake_max_iterations: u32,
    pub history_turns: usize,
    pub default_agent: String,
    pub default_tools: Vec<String>,
    pub channel_tools: HashMap<String, Vec<String>>,
    pub channel_owners: HashMap<String, Vec<String>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let settings = AgentSettings::default();
        Self {
            process_mode: ProcessMode::default(),
            wake_interval_secs: 0,
            wake_max_iterations: settings.wake_max_iterations,
            history_turns: settings.history_turns,
            default_agent: DEFAULT_AGENT.to_string(),
            default_tools: settings.default_tools,
            channel_tools: HashMap::new(),
            channel_owners: HashMap::new(),
        }
    }
}

impl AgentConfig {
    pub fn to_settings(&self) -> AgentSettings {
        AgentSettings {
            default_agent: self.default_agent.clone(),
            default_tools: self.default_tools.clone(),
            channel_tools: self.channel_tools.clone(),
            channel_owners: self.channel_owners.clone(),
            history_turns: self.history_turns,
            wake_interval: (self.wake_interval_secs > 0).then(|| Duration::from_secs(self.wake_interval_secs)),
            wake_max_iterations: self.wake_max_iterations,
        }
    }
}

/// `[gateway]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket 监听地址
    pub bind_addr: String,
    /// HTTP API 监听地址
    pub http_bind_addr: String,
    pub api_key: Option<String>,
    pub reply_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            http_bind_addr: "127.0.0.1:9001".to_string(),
            api_key: None,
            reply_timeout_secs: 130,
        }
    }
}

#[cfg(feature = "gateway")]
impl GatewayConfig {
    pub fn to_settings(&self) -> crate::gateway::ServerSettings {
        crate::gateway::ServerSettings {
            bind_addr: self.bind_addr.clone(),
            http_bind_addr: self.http_bind_addr.clone(),
            api_key: self.api_key.clone().filter(|key| !key.is_empty()),
            reply_timeout: Duration::from_secs(self.reply_timeout_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 SWITCHBOARD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 SWITCHBOARD__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SWITCHBOARD")
            .separator("__")
            .try_parsing(true),
    );

    Ok(builder.build()?.try_deserialize()?)
}
