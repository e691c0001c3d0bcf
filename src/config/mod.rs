pub mod env;
pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::{BundleConfig, Config, HttpConfig, ModulesConfig, PoolConfig};

/// 读取 YAML 配置：展开环境变量、解析、校验
pub fn load_config(path: &str) -> Result<Config> {
    let content = load_config_content(path)?;
    let config = parse_config(&content)?;
    tracing::debug!(path = path, bundles = config.bundles.len(), "config parsed");
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = serde_yml::from_str(content).context("invalid config yaml")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_content(path: &str) -> Result<String> {
    let raw = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config {}", path))?;
    Ok(env::expand_env_vars(&raw))
}
