use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub bundles: Vec<BundleConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for bundle in &self.bundles {
            if !names.insert(bundle.name.as_str()) {
                anyhow::bail!("duplicate bundle name '{}'", bundle.name);
            }
            bundle.pool.validate(&bundle.name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 脚本侧 HTTP 客户端设置
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// 同步请求超时（秒）；后台请求不设超时
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_http_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!("luagate/", env!("CARGO_PKG_VERSION")).to_string()
}

/// 可选宿主模块开关，`ext` 总是安装
#[derive(Debug, Clone, Deserialize)]
pub struct ModulesConfig {
    #[serde(default = "default_true")]
    pub http: bool,
    #[serde(default = "default_true")]
    pub url: bool,
    #[serde(default = "default_true")]
    pub bit32: bool,
    #[serde(default = "default_true")]
    pub crypto: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            http: true,
            url: true,
            bit32: true,
            crypto: true,
        }
    }
}

impl ModulesConfig {
    /// 只安装 `ext`
    pub fn none() -> Self {
        Self {
            http: false,
            url: false,
            bit32: false,
            crypto: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// 单个脚本包
#[derive(Debug, Clone, Deserialize)]
pub struct BundleConfig {
    pub name: String,
    /// 脚本包目录
    pub path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub pool: PoolConfig,
}

/// 实例池设置
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// 同时存活的实例上限（空闲 + 借出）
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// 创建池时预先加载的实例数
    #[serde(default = "default_prewarm")]
    pub prewarm: usize,
    /// 池满时 borrow 的最长等待时间，0 表示一直等到有实例归还或池关闭
    #[serde(default)]
    pub borrow_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            prewarm: default_prewarm(),
            borrow_timeout_ms: 0,
        }
    }
}

impl PoolConfig {
    pub fn borrow_timeout(&self) -> Option<Duration> {
        (self.borrow_timeout_ms > 0).then(|| Duration::from_millis(self.borrow_timeout_ms))
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_instances == 0 {
            anyhow::bail!("bundle '{}': max_instances must be at least 1", name);
        }
        if self.prewarm > self.max_instances {
            anyhow::bail!(
                "bundle '{}': prewarm ({}) exceeds max_instances ({})",
                name,
                self.prewarm,
                self.max_instances
            );
        }
        Ok(())
    }
}

fn default_max_instances() -> usize {
    4
}

fn default_prewarm() -> usize {
    1
}
