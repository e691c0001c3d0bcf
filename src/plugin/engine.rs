//! 脚本引擎：加载脚本包、调用脚本函数
//!
//! 每个 [`ScriptInstance`] 拥有一个独立的 Lua 状态。加载流程：
//!
//! 1. 按脚本包目录设置 `package.path`
//! 2. 预加载 `ext` 以及配置启用的可选模块
//! 3. 执行入口文件一次，填充全局状态
//!
//! 任何一步失败，半初始化的状态都会被立即关闭，错误返回给调用方。
//! 调用 `checkproxy` 时的任何失败都降级为 `false`。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{ChunkMode, Function, Lua, LuaOptions, StdLib, Table, Value};
use tracing::{debug, warn};

use super::bundle::{Bundle, EntryKind};
use super::host_api::{build_ext_module, HostHttp, EXT_MODULE};
use super::modules;
use crate::common::error::{Result, ScriptError};
use crate::config::types::ModulesConfig;

/// 代理判定函数名
pub const CHECK_PROXY_FN: &str = "checkproxy";

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// 一个已加载完成的解释器实例。同一时刻只能被一个调用方使用。
pub struct ScriptInstance {
    id: u64,
    lua: Lua,
    bundle_dir: PathBuf,
}

impl std::fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInstance")
            .field("id", &self.id)
            .field("bundle_dir", &self.bundle_dir)
            .finish()
    }
}

impl ScriptInstance {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// 取全局函数，不存在或不是函数时为 `None`
    pub fn global_function(&self, name: &str) -> mlua::Result<Option<Function>> {
        match self.lua.globals().get::<Value>(name)? {
            Value::Function(f) => Ok(Some(f)),
            _ => Ok(None),
        }
    }

    /// 调用单参数谓词函数。`Ok(None)` 表示函数不存在；返回值不是布尔时报错。
    pub fn call_predicate(&self, name: &str, arg: &str) -> mlua::Result<Option<bool>> {
        let Some(func) = self.global_function(name)? else {
            return Ok(None);
        };
        match func.call::<Value>(arg)? {
            Value::Boolean(b) => Ok(Some(b)),
            other => Err(mlua::Error::RuntimeError(format!(
                "{} returned {} instead of boolean",
                name,
                other.type_name()
            ))),
        }
    }

    /// 询问脚本 `domain` 是否走代理；任何失败都返回 `false`
    pub fn check_proxy(&self, domain: &str) -> bool {
        match self.call_predicate(CHECK_PROXY_FN, domain) {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                debug!(instance = self.id, "checkproxy is not defined");
                false
            }
            Err(e) => {
                warn!(instance = self.id, domain = domain, error = %e, "checkproxy failed");
                false
            }
        }
    }

    /// 关闭 Lua 状态
    pub fn close(self) {
        debug!(instance = self.id, bundle = %self.bundle_dir.display(), "script instance closed");
        drop(self.lua);
    }
}

/// 实例工厂。所有实例共享同一个 [`HostHttp`]，此外没有共享的可变状态。
#[derive(Clone)]
pub struct ScriptLoader {
    http: Arc<HostHttp>,
    modules: ModulesConfig,
}

impl ScriptLoader {
    pub fn new(http: Arc<HostHttp>, modules: ModulesConfig) -> Self {
        Self { http, modules }
    }

    pub fn http(&self) -> &Arc<HostHttp> {
        &self.http
    }

    /// 创建并初始化一个新实例
    pub fn load(&self, bundle: &Bundle) -> Result<ScriptInstance> {
        let entry = bundle.entry();
        let source = std::fs::read(entry).map_err(|source| ScriptError::Io {
            path: entry.to_path_buf(),
            source,
        })?;

        let lua = new_state(bundle.kind());
        let result = self
            .install(&lua, bundle)
            .and_then(|installed| {
                debug!(bundle = %bundle.dir().display(), modules = ?installed, "host modules preloaded");
                lua.load(&source[..])
                    .set_name(format!("@{}", entry.display()))
                    .set_mode(chunk_mode(bundle.kind()))
                    .exec()
            });

        if let Err(source) = result {
            drop(lua);
            warn!(entry = %entry.display(), error = %source, "script load failed");
            return Err(ScriptError::Load {
                entry: entry.to_path_buf(),
                source,
            });
        }

        let id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(instance = id, bundle = %bundle.dir().display(), "script instance loaded");
        Ok(ScriptInstance {
            id,
            lua,
            bundle_dir: bundle.dir().to_path_buf(),
        })
    }

    /// 设置搜索路径并注册预加载模块
    fn install(&self, lua: &Lua, bundle: &Bundle) -> mlua::Result<Vec<&'static str>> {
        let package: Table = lua.globals().get("package")?;
        package.set("path", bundle.search_path())?;
        let preload: Table = package.get("preload")?;

        let http = Arc::clone(&self.http);
        let dir = bundle.dir().to_path_buf();
        modules::register(lua, &preload, EXT_MODULE, move |lua| {
            build_ext_module(lua, &http, &dir)
        })?;

        let mut installed = vec![EXT_MODULE];
        installed.extend(modules::preload_enabled(lua, &preload, &self.modules, &self.http)?);
        Ok(installed)
    }
}

fn new_state(kind: EntryKind) -> Lua {
    match kind {
        EntryKind::Source => Lua::new(),
        // SAFETY: 只有 unsafe 模式允许加载字节码；脚本包作者是受信任的
        EntryKind::Compiled => unsafe { Lua::unsafe_new_with(StdLib::ALL_SAFE, LuaOptions::new()) },
    }
}

fn chunk_mode(kind: EntryKind) -> ChunkMode {
    match kind {
        EntryKind::Source => ChunkMode::Text,
        EntryKind::Compiled => ChunkMode::Binary,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::common::error::ScriptErrorKind;

    fn bundle(files: &[(&str, &str)]) -> (tempfile::TempDir, Bundle) {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), files);
        let bundle = Bundle::open(dir.path()).unwrap();
        (dir, bundle)
    }

    #[test]
    fn load_and_check_proxy() {
        let (_dir, b) = bundle(&[("entry.lua", GOOGLE_ONLY)]);
        let inst = loader().load(&b).unwrap();
        assert!(inst.check_proxy("www.google.com"));
        assert!(!inst.check_proxy("example.com"));
        assert_eq!(inst.bundle_dir(), b.dir());
    }

    #[test]
    fn entry_runtime_error_is_load_error() {
        let (_dir, b) = bundle(&[("entry.lua", "error('boom')")]);
        let err = loader().load(&b).unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::Load);
        assert!(err.to_string().contains("entry.lua"));
    }

    #[test]
    fn entry_syntax_error_is_load_error() {
        let (_dir, b) = bundle(&[("entry.lua", "function checkproxy(")]);
        assert!(matches!(loader().load(&b), Err(ScriptError::Load { .. })));
    }

    #[test]
    fn missing_checkproxy_is_false() {
        let (_dir, b) = bundle(&[("entry.lua", "x = 1")]);
        let inst = loader().load(&b).unwrap();
        assert!(!inst.check_proxy("example.com"));
        assert_eq!(inst.call_predicate(CHECK_PROXY_FN, "example.com").unwrap(), None);
    }

    #[test]
    fn checkproxy_not_a_function_is_false() {
        let (_dir, b) = bundle(&[("entry.lua", "checkproxy = true")]);
        let inst = loader().load(&b).unwrap();
        assert!(!inst.check_proxy("example.com"));
    }

    #[test]
    fn runtime_error_in_checkproxy_is_false() {
        let (_dir, b) = bundle(&[(
            "entry.lua",
            "function checkproxy(d) error('bad ' .. d) end",
        )]);
        let inst = loader().load(&b).unwrap();
        assert!(!inst.check_proxy("example.com"));
        // 出错后实例仍可继续使用
        assert!(inst.call_predicate(CHECK_PROXY_FN, "x").is_err());
    }

    #[test]
    fn non_boolean_result_is_false() {
        let (_dir, b) = bundle(&[("entry.lua", "function checkproxy(d) return 'yes' end")]);
        let inst = loader().load(&b).unwrap();
        assert!(!inst.check_proxy("example.com"));
    }

    #[test]
    fn extra_return_values_are_ignored() {
        let (_dir, b) = bundle(&[("entry.lua", "function checkproxy(d) return true, 'x' end")]);
        let inst = loader().load(&b).unwrap();
        assert!(inst.check_proxy("example.com"));
    }

    #[test]
    fn require_sibling_and_package_init() {
        let (_dir, b) = bundle(&[
            (
                "entry.lua",
                r#"
                local rules = require "rules"
                local lists = require "lists"
                function checkproxy(d) return rules.match(d) or lists[d] == true end
            "#,
            ),
            (
                "rules.lua",
                "return { match = function(d) return d:sub(-3) == '.jp' end }",
            ),
            ("lists/init.lua", "return { ['blocked.example'] = true }"),
        ]);
        let inst = loader().load(&b).unwrap();
        assert!(inst.check_proxy("www.example.jp"));
        assert!(inst.check_proxy("blocked.example"));
        assert!(!inst.check_proxy("example.com"));
    }

    #[test]
    fn require_compiled_sibling_and_package_init() {
        let compile = |src: &str| {
            let lua = Lua::new();
            lua.load(src).into_function().unwrap().dump(false)
        };
        let dir = tempfile::tempdir().unwrap();
        write_files(
            dir.path(),
            &[(
                "entry.lua",
                r#"
                local rules = require "rules"
                local lists = require "lists"
                function checkproxy(d) return rules.match(d) or lists[d] == true end
            "#,
            )],
        );
        std::fs::write(
            dir.path().join("rules.luc"),
            compile("return { match = function(d) return d:sub(-3) == '.jp' end }"),
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("lists")).unwrap();
        std::fs::write(
            dir.path().join("lists/init.luc"),
            compile("return { ['blocked.example'] = true }"),
        )
        .unwrap();

        let b = Bundle::open(dir.path()).unwrap();
        assert_eq!(b.kind(), EntryKind::Source);
        let inst = loader().load(&b).unwrap();
        assert!(inst.check_proxy("x.jp"));
        assert!(inst.check_proxy("blocked.example"));
        assert!(!inst.check_proxy("example.com"));
    }

    #[test]
    fn ext_is_available_during_entry() {
        let (_dir, b) = bundle(&[(
            "entry.lua",
            r#"
                local ext = require "ext"
                SCRIPT_DIR = ext.script_dir
                EXT_NAME = ext.name
            "#,
        )]);
        let inst = loader().load(&b).unwrap();
        let dir: String = inst.lua().globals().get("SCRIPT_DIR").unwrap();
        let name: String = inst.lua().globals().get("EXT_NAME").unwrap();
        assert_eq!(Path::new(&dir), b.dir());
        assert_eq!(name, crate::plugin::host_api::EXT_DISPLAY_NAME);
    }

    #[test]
    fn optional_modules_follow_config() {
        let src = r#"
            local bit32 = require "bit32"
            function checkproxy(d) return bit32.band(#d, 1) == 1 end
        "#;
        let (_dir, b) = bundle(&[("entry.lua", src)]);

        let inst = loader().load(&b).unwrap();
        assert!(inst.check_proxy("abc"));
        assert!(!inst.check_proxy("ab"));

        let err = loader_with(ModulesConfig::none()).load(&b).unwrap_err();
        assert_eq!(err.kind(), ScriptErrorKind::Load);
    }

    #[test]
    fn instances_do_not_share_state() {
        let (_dir, b) = bundle(&[(
            "entry.lua",
            r#"
                counter = 0
                function checkproxy(d) counter = counter + 1 return counter > 1 end
            "#,
        )]);
        let ldr = loader();
        let a = ldr.load(&b).unwrap();
        let c = ldr.load(&b).unwrap();
        assert_ne!(a.id(), c.id());

        assert!(!a.check_proxy("x"));
        assert!(a.check_proxy("x"));
        // 另一个实例的计数器不受影响
        assert!(!c.check_proxy("x"));
    }

    #[test]
    fn compiled_entry_loads() {
        let dir = tempfile::tempdir().unwrap();
        let bytecode = {
            let lua = Lua::new();
            lua.load(GOOGLE_ONLY).into_function().unwrap().dump(false)
        };
        std::fs::write(dir.path().join("entry.luc"), bytecode).unwrap();

        let b = Bundle::open(dir.path()).unwrap();
        assert_eq!(b.kind(), EntryKind::Compiled);
        let inst = loader().load(&b).unwrap();
        assert!(inst.check_proxy("google.com"));
    }

    #[test]
    fn vanished_entry_is_io_error() {
        let (dir, b) = bundle(&[("entry.lua", GOOGLE_ONLY)]);
        std::fs::remove_file(dir.path().join("entry.lua")).unwrap();
        assert!(matches!(loader().load(&b), Err(ScriptError::Io { .. })));
    }
}
