//! 服务器配置
//!
//! 支持配置文件 + 环境变量(前缀LIS__)分层覆盖。

use config::{Config, Environment, File};
use lis_core::{BoundaryPolicy, LisError, Result};
use serde::{Deserialize, Serialize};

/// 完整服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LisConfig {
    /// Web服务配置
    pub server: ServerConfig,
    /// 存储配置
    pub database: DatabaseConfig,
    /// 通知配置
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// 检验业务配置
    pub lab: LabSettings,
}

/// Web服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 存储后端
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    pub url: Option<String>,
    pub max_connections: u32,
}

/// 通知配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// 结果就绪事件的Webhook地址, 不配则只记日志
    pub result_ready_url: Option<String>,
}

/// 检验业务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSettings {
    /// 差值核查阈值 (%)
    pub delta_threshold_percent: f64,
    /// 参考范围边界比较策略
    pub boundary_policy: BoundaryPolicy,
}

impl Default for LisConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                backend: StorageBackend::Memory,
                url: None,
                max_connections: 10,
            },
            notifier: NotifierConfig {
                result_ready_url: None,
            },
            lab: LabSettings {
                delta_threshold_percent: 50.0,
                boundary_policy: BoundaryPolicy::Strict,
            },
        }
    }
}

impl LisConfig {
    /// 从配置文件与环境变量加载, 文件缺失时用默认值
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = LisConfig::default();

        let mut builder = Config::builder()
            .set_default("server.host", defaults.server.host.clone())
            .and_then(|b| b.set_default("server.port", defaults.server.port as i64))
            .and_then(|b| b.set_default("database.backend", "memory"))
            .and_then(|b| {
                b.set_default(
                    "database.max_connections",
                    defaults.database.max_connections as i64,
                )
            })
            .and_then(|b| {
                b.set_default(
                    "lab.delta_threshold_percent",
                    defaults.lab.delta_threshold_percent,
                )
            })
            .and_then(|b| b.set_default("lab.boundary_policy", "Strict"))
            .map_err(|e| LisError::Config(e.to_string()))?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(Environment::with_prefix("LIS").separator("__"));

        builder
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| LisError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_loads() {
        let config = LisConfig::load(None).unwrap();
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.lab.delta_threshold_percent, 50.0);
        assert_eq!(config.lab.boundary_policy, BoundaryPolicy::Strict);
        assert!(config.notifier.result_ready_url.is_none());
    }
}
