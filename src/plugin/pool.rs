//! 解释器实例池
//!
//! 每个脚本包一个池。空闲实例放在栈里（LIFO），不够用时通过 [`ScriptLoader`]
//! 按需创建，存活实例（空闲 + 借出）不超过 `max_instances`；达到上限后
//! `borrow` 阻塞等待归还、池关闭或超时。
//!
//! 借出的实例包在 [`PooledInstance`] 中，drop 时自动归还。`shutdown` 之后
//! 空闲实例立即关闭，仍在借出中的实例在归还时关闭，每个实例恰好关闭一次。

use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::bundle::Bundle;
use super::engine::{ScriptInstance, ScriptLoader};
use crate::common::error::{Result, ScriptError};
use crate::config::types::PoolConfig;

struct PoolState {
    idle: Vec<ScriptInstance>,
    /// 空闲 + 借出 + 正在创建
    live: usize,
    closed: bool,
}

/// 池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub live: usize,
    pub created: u64,
    pub destroyed: u64,
    pub closed: bool,
}

pub struct InstancePool {
    bundle: Bundle,
    loader: ScriptLoader,
    config: PoolConfig,
    state: Mutex<PoolState>,
    returned: Condvar,
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl InstancePool {
    /// 解析脚本包并创建池，预热 `config.prewarm` 个实例。预热失败时已创建的实例全部关闭。
    pub fn open(path: impl AsRef<Path>, loader: ScriptLoader, config: PoolConfig) -> Result<Self> {
        let bundle = Bundle::open(path)?;
        Self::with_bundle(bundle, loader, config)
    }

    pub fn with_bundle(bundle: Bundle, loader: ScriptLoader, config: PoolConfig) -> Result<Self> {
        config
            .validate(&bundle.dir().display().to_string())
            .map_err(|e| ScriptError::Config(e.to_string()))?;

        let pool = Self {
            bundle,
            loader,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(4),
                live: 0,
                closed: false,
            }),
            returned: Condvar::new(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        };

        let mut warm = Vec::with_capacity(pool.config.prewarm);
        for _ in 0..pool.config.prewarm {
            // warm 还没放进池里，失败时需要单独关闭
            match pool.create() {
                Ok(inst) => warm.push(inst),
                Err(e) => {
                    for inst in warm {
                        pool.destroy(inst);
                    }
                    return Err(e);
                }
            }
        }
        {
            let mut state = pool.lock();
            state.live = warm.len();
            state.idle = warm;
        }

        info!(
            bundle = %pool.bundle.dir().display(),
            max_instances = pool.config.max_instances,
            prewarm = pool.config.prewarm,
            "script pool ready"
        );
        Ok(pool)
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // 持锁期间不会执行脚本，poison 只可能来自本模块内部的 panic
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create(&self) -> Result<ScriptInstance> {
        let inst = self.loader.load(&self.bundle)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(inst)
    }

    fn destroy(&self, inst: ScriptInstance) {
        inst.close();
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// 借出一个实例：优先复用空闲实例，其次在上限内新建，否则等待
    pub fn borrow(&self) -> Result<PooledInstance<'_>> {
        let deadline = self.config.borrow_timeout().map(|t| Instant::now() + t);
        let mut state = self.lock();

        loop {
            if state.closed {
                return Err(ScriptError::PoolClosed(self.bundle.dir().to_path_buf()));
            }
            if let Some(inst) = state.idle.pop() {
                return Ok(PooledInstance::new(self, inst));
            }
            if state.live < self.config.max_instances {
                // 先占位，在锁外加载
                state.live += 1;
                drop(state);
                return match self.create() {
                    Ok(inst) => {
                        debug!(
                            bundle = %self.bundle.dir().display(),
                            instance = inst.id(),
                            "pool grew"
                        );
                        Ok(PooledInstance::new(self, inst))
                    }
                    Err(e) => {
                        self.release_slot();
                        Err(e)
                    }
                };
            }

            state = match deadline {
                None => self
                    .returned
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let waited = self.config.borrow_timeout().unwrap_or(Duration::ZERO);
                        return Err(ScriptError::PoolExhausted(waited));
                    }
                    self.returned
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// 不阻塞的 borrow：没有空闲实例且已到上限时返回 `None`
    pub fn try_borrow(&self) -> Result<Option<PooledInstance<'_>>> {
        let mut state = self.lock();
        if state.closed {
            return Err(ScriptError::PoolClosed(self.bundle.dir().to_path_buf()));
        }
        if let Some(inst) = state.idle.pop() {
            return Ok(Some(PooledInstance::new(self, inst)));
        }
        if state.live >= self.config.max_instances {
            return Ok(None);
        }
        state.live += 1;
        drop(state);
        match self.create() {
            Ok(inst) => Ok(Some(PooledInstance::new(self, inst))),
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    fn release_slot(&self) {
        let mut state = self.lock();
        state.live -= 1;
        drop(state);
        self.returned.notify_one();
    }

    /// 归还实例；池已关闭则直接关闭实例
    fn put(&self, inst: ScriptInstance) {
        let mut state = self.lock();
        if state.closed {
            state.live -= 1;
            drop(state);
            debug!(instance = inst.id(), "returned to closed pool");
            self.destroy(inst);
            return;
        }
        state.idle.push(inst);
        drop(state);
        self.returned.notify_one();
    }

    fn discard(&self, inst: ScriptInstance) {
        self.destroy(inst);
        self.release_slot();
    }

    /// 关闭池：关闭所有空闲实例，唤醒所有等待者。借出中的实例在归还时关闭。
    pub fn shutdown(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        state.live -= idle.len();
        let in_flight = state.live;
        drop(state);
        self.returned.notify_all();

        let closed = idle.len();
        for inst in idle {
            self.destroy(inst);
        }
        info!(
            bundle = %self.bundle.dir().display(),
            closed = closed,
            in_flight = in_flight,
            "script pool shut down"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.idle.len(),
            live: state.live,
            created: self.created.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }

    /// 借一个实例询问 `domain` 是否走代理。借不到实例时同样返回 `false`。
    pub fn check_proxy(&self, domain: &str) -> bool {
        match self.borrow() {
            Ok(inst) => inst.check_proxy(domain),
            Err(e) => {
                warn!(
                    bundle = %self.bundle.dir().display(),
                    domain = domain,
                    error = %e,
                    "no script instance for checkproxy"
                );
                false
            }
        }
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 借出的实例，drop 时归还到池中
pub struct PooledInstance<'a> {
    pool: &'a InstancePool,
    inst: Option<ScriptInstance>,
}

impl<'a> PooledInstance<'a> {
    fn new(pool: &'a InstancePool, inst: ScriptInstance) -> Self {
        Self {
            pool,
            inst: Some(inst),
        }
    }

    /// 不归还，直接关闭（例如实例状态已被脚本破坏）
    pub fn discard(mut self) {
        if let Some(inst) = self.inst.take() {
            self.pool.discard(inst);
        }
    }
}

impl Deref for PooledInstance<'_> {
    type Target = ScriptInstance;

    fn deref(&self) -> &ScriptInstance {
        self.inst
            .as_ref()
            .expect("pooled instance is present until drop")
    }
}

impl Drop for PooledInstance<'_> {
    fn drop(&mut self) {
        if let Some(inst) = self.inst.take() {
            self.pool.put(inst);
        }
    }
}
