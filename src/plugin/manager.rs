//! 脚本包管理器
//!
//! 按名称管理多个脚本包，每个包一个 [`InstancePool`]，支持热重载。
//! 池的创建和 `checkproxy` 调用都会阻塞，统一放到 `spawn_blocking` 上执行。

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::bundle::EntryKind;
use super::engine::ScriptLoader;
use super::host_api::HostHttp;
use super::pool::{InstancePool, PoolStats};
use crate::common::error::{Result, ScriptError};
use crate::config::types::{BundleConfig, Config, PoolConfig};

/// 脚本包元数据
#[derive(Debug, Clone)]
pub struct BundleMeta {
    pub name: String,
    pub dir: PathBuf,
    pub entry: PathBuf,
    pub kind: EntryKind,
    pub enabled: bool,
    pub pool: PoolConfig,
    pub stats: PoolStats,
}

struct LoadedBundle {
    name: String,
    enabled: bool,
    pool: Arc<InstancePool>,
}

impl LoadedBundle {
    fn meta(&self) -> BundleMeta {
        let bundle = self.pool.bundle();
        BundleMeta {
            name: self.name.clone(),
            dir: bundle.dir().to_path_buf(),
            entry: bundle.entry().to_path_buf(),
            kind: bundle.kind(),
            enabled: self.enabled,
            pool: self.pool.config().clone(),
            stats: self.pool.stats(),
        }
    }
}

pub struct ScriptManager {
    loader: ScriptLoader,
    bundles: Arc<RwLock<Vec<LoadedBundle>>>,
}

impl ScriptManager {
    pub fn new(loader: ScriptLoader) -> Self {
        Self {
            loader,
            bundles: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// 按配置中的 http/modules 段构建 loader，不加载任何包
    pub fn from_config(config: &Config) -> Self {
        let http = Arc::new(HostHttp::new(&config.http));
        Self::new(ScriptLoader::new(http, config.modules.clone()))
    }

    /// 加载所有启用的包，返回每个失败包的错误描述
    pub async fn load_from_configs(&self, configs: &[BundleConfig]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut loaded = 0usize;

        for config in configs {
            if !config.enabled {
                debug!(name = config.name, "bundle disabled, skipping");
                continue;
            }
            match self.load_bundle(config).await {
                Ok(()) => loaded += 1,
                Err(e) => {
                    warn!(name = config.name, error = %e, "failed to load bundle");
                    errors.push(format!("{}: {}", config.name, e));
                }
            }
        }

        if loaded > 0 {
            info!(count = loaded, "bundles loaded");
        }
        errors
    }

    async fn open_pool(&self, path: PathBuf, pool: PoolConfig) -> Result<InstancePool> {
        let loader = self.loader.clone();
        tokio::task::spawn_blocking(move || InstancePool::open(path, loader, pool))
            .await
            .map_err(|e| ScriptError::Other(anyhow::anyhow!("pool construction task failed: {}", e)))?
    }

    /// 加载单个包；同名包已存在时原子替换并关闭旧池
    pub async fn load_bundle(&self, config: &BundleConfig) -> Result<()> {
        config
            .pool
            .validate(&config.name)
            .map_err(|e| ScriptError::Config(e.to_string()))?;
        let pool = self
            .open_pool(PathBuf::from(&config.path), config.pool.clone())
            .await?;
        self.install(&config.name, config.enabled, pool).await;
        Ok(())
    }

    async fn install(&self, name: &str, enabled: bool, pool: InstancePool) {
        let entry = LoadedBundle {
            name: name.to_string(),
            enabled,
            pool: Arc::new(pool),
        };

        let mut bundles = self.bundles.write().await;
        let old = match bundles.iter().position(|b| b.name == name) {
            Some(pos) => Some(std::mem::replace(&mut bundles[pos], entry)),
            None => {
                bundles.push(entry);
                None
            }
        };
        drop(bundles);

        match old {
            Some(old) => {
                old.pool.shutdown();
                info!(name = name, "bundle hot-reloaded");
            }
            None => info!(name = name, "bundle loaded"),
        }
    }

    /// 从磁盘重新加载指定包，沿用原有路径、池设置和启用状态。
    /// 新池创建失败时旧池保持不变。
    pub async fn reload_bundle(&self, name: &str) -> Result<()> {
        let (dir, pool, enabled) = {
            let bundles = self.bundles.read().await;
            let b = bundles
                .iter()
                .find(|b| b.name == name)
                .ok_or_else(|| ScriptError::Config(format!("bundle '{}' not found", name)))?;
            (
                b.pool.bundle().dir().to_path_buf(),
                b.pool.config().clone(),
                b.enabled,
            )
        };

        let fresh = self.open_pool(dir, pool).await?;
        self.install(name, enabled, fresh).await;
        Ok(())
    }

    pub async fn unload_bundle(&self, name: &str) -> bool {
        let mut bundles = self.bundles.write().await;
        let Some(pos) = bundles.iter().position(|b| b.name == name) else {
            return false;
        };
        let removed = bundles.remove(pos);
        drop(bundles);
        removed.pool.shutdown();
        info!(name = name, "bundle unloaded");
        true
    }

    pub async fn set_bundle_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut bundles = self.bundles.write().await;
        if let Some(b) = bundles.iter_mut().find(|b| b.name == name) {
            b.enabled = enabled;
            info!(name = name, enabled = enabled, "bundle state changed");
            true
        } else {
            false
        }
    }

    pub async fn list_bundles(&self) -> Vec<BundleMeta> {
        let bundles = self.bundles.read().await;
        bundles.iter().map(LoadedBundle::meta).collect()
    }

    pub async fn count(&self) -> usize {
        self.bundles.read().await.len()
    }

    /// 用指定包判断 `domain` 是否走代理。包不存在、已禁用或调用失败都返回 `false`。
    pub async fn check_proxy(&self, name: &str, domain: &str) -> bool {
        let pool = {
            let bundles = self.bundles.read().await;
            match bundles.iter().find(|b| b.name == name) {
                Some(b) if b.enabled => b.pool.clone(),
                Some(_) => {
                    debug!(name = name, "bundle disabled, checkproxy skipped");
                    return false;
                }
                None => {
                    debug!(name = name, "unknown bundle");
                    return false;
                }
            }
        };

        let domain = domain.to_string();
        match tokio::task::spawn_blocking(move || pool.check_proxy(&domain)).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(name = name, error = %e, "checkproxy task failed");
                false
            }
        }
    }

    /// 关闭并移除所有包
    pub async fn shutdown(&self) {
        let drained: Vec<LoadedBundle> = self.bundles.write().await.drain(..).collect();
        let count = drained.len();
        for b in drained {
            b.pool.shutdown();
        }
        if count > 0 {
            info!(count = count, "script manager shut down");
        }
    }
}
