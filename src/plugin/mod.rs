//! Lua 脚本插件
//!
//! 一个脚本包（目录 + `entry.lua`/`entry.luc`）对应一个实例池，池里每个实例是
//! 独立的 Lua 解释器，入口执行后导出全局函数 `checkproxy(domain)`。
//!
//! - [`bundle`]：入口文件探测
//! - [`host_api`]：宿主扩展模块 `ext`
//! - [`modules`]：可选的 http/url/bit32/crypto 模块
//! - [`engine`]：解释器创建、加载和 `checkproxy` 调用
//! - [`pool`]：有界实例池
//! - [`manager`]：按名称管理多个脚本包，支持热重载

pub mod bundle;
pub mod engine;
pub mod host_api;
pub mod manager;
pub mod modules;
pub mod pool;

pub use bundle::{is_bundle, Bundle, EntryKind};
pub use engine::{ScriptInstance, ScriptLoader, CHECK_PROXY_FN};
pub use host_api::{HostHttp, EXT_MODULE};
pub use manager::{BundleMeta, ScriptManager};
pub use pool::{InstancePool, PoolStats, PooledInstance};
