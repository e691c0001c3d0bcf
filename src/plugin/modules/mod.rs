//! 可选宿主模块
//!
//! 通过 `package.preload` 注册，脚本 `require` 时才真正构造。
//! 这些模块都是附加能力，`checkproxy` 不依赖它们。

pub mod bit32;
pub mod crypto;
pub mod http;
pub mod url;

use std::sync::Arc;

use mlua::{Lua, MultiValue, Table};

use crate::config::types::ModulesConfig;
use crate::plugin::host_api::HostHttp;

/// 在 `preload` 表中注册一个模块构造器
pub(crate) fn register<F>(lua: &Lua, preload: &Table, name: &str, build: F) -> mlua::Result<()>
where
    F: Fn(&Lua) -> mlua::Result<Table> + Send + 'static,
{
    let loader = lua.create_function(move |lua, _args: MultiValue| build(lua))?;
    preload.set(name, loader)
}

/// 注册配置中启用的可选模块，返回已注册的模块名
pub fn preload_enabled(
    lua: &Lua,
    preload: &Table,
    modules: &ModulesConfig,
    http: &Arc<HostHttp>,
) -> mlua::Result<Vec<&'static str>> {
    let mut names = Vec::new();
    if modules.http {
        let http = Arc::clone(http);
        register(lua, preload, "http", move |lua| http::open(lua, &http))?;
        names.push("http");
    }
    if modules.url {
        register(lua, preload, "url", url::open)?;
        names.push("url");
    }
    if modules.bit32 {
        register(lua, preload, "bit32", bit32::open)?;
        names.push("bit32");
    }
    if modules.crypto {
        register(lua, preload, "crypto", crypto::open)?;
        names.push("crypto");
    }
    Ok(names)
}
