//! `url` 模块：URL 解析、拼装、查询串编码

use mlua::{Lua, Table, Value};
use reqwest::Url;

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.to_string_lossy().to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => Some((*n as i64).to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse(lua: &Lua, raw: &str) -> mlua::Result<Table> {
    let url = Url::parse(raw).map_err(mlua::Error::external)?;
    let t = lua.create_table()?;
    t.set("scheme", url.scheme())?;
    if !url.username().is_empty() {
        t.set("username", url.username())?;
    }
    if let Some(password) = url.password() {
        t.set("password", password)?;
    }
    if let Some(host) = url.host_str() {
        // 和 URL 里写的一样：显式端口时带上端口
        match url.port() {
            Some(port) => t.set("host", format!("{}:{}", host, port))?,
            None => t.set("host", host)?,
        }
        t.set("hostname", host)?;
    }
    if let Some(port) = url.port_or_known_default() {
        t.set("port", port)?;
    }
    t.set("path", url.path())?;
    if let Some(query) = url.query() {
        t.set("query", query)?;
    }
    if let Some(fragment) = url.fragment() {
        t.set("fragment", fragment)?;
    }
    Ok(t)
}

fn build(t: &Table) -> mlua::Result<String> {
    let scheme: Option<String> = t.get("scheme")?;
    let host: Option<String> = t.get("host")?;
    let username: Option<String> = t.get("username")?;
    let password: Option<String> = t.get("password")?;
    let path: Option<String> = t.get("path")?;
    let query: Option<String> = t.get("query")?;
    let fragment: Option<String> = t.get("fragment")?;

    let mut out = format!("{}://", scheme.as_deref().unwrap_or("http"));
    if let Some(user) = username.filter(|u| !u.is_empty()) {
        out.push_str(&user);
        if let Some(pass) = password {
            out.push(':');
            out.push_str(&pass);
        }
        out.push('@');
    }
    out.push_str(host.as_deref().unwrap_or(""));
    if let Some(path) = path.filter(|p| !p.is_empty()) {
        if !path.starts_with('/') {
            out.push('/');
        }
        out.push_str(&path);
    }
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        out.push('?');
        out.push_str(&query);
    }
    if let Some(fragment) = fragment.filter(|f| !f.is_empty()) {
        out.push('#');
        out.push_str(&fragment);
    }

    Ok(Url::parse(&out).map(|u| u.to_string()).unwrap_or(out))
}

/// 按键排序的 `k=v&k=v`，数组值重复同一个键
fn build_query_string(t: &Table) -> mlua::Result<String> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    for entry in t.pairs::<Value, Value>() {
        let (k, v) = entry?;
        let Some(key) = scalar_to_string(&k) else {
            continue;
        };
        match &v {
            Value::Table(items) => {
                for item in items.sequence_values::<Value>() {
                    if let Some(s) = scalar_to_string(&item?) {
                        pairs.push((key.clone(), s));
                    }
                }
            }
            other => {
                if let Some(s) = scalar_to_string(other) {
                    pairs.push((key, s));
                }
            }
        }
    }
    // 稳定排序，保留同键数组的原始顺序
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut scratch = Url::parse("http://query.invalid/").map_err(mlua::Error::external)?;
    scratch.query_pairs_mut().extend_pairs(pairs.iter());
    Ok(scratch.query().unwrap_or("").to_string())
}

pub fn open(lua: &Lua) -> mlua::Result<Table> {
    let m = lua.create_table()?;

    m.set(
        "parse",
        lua.create_function(|lua, raw: String| match parse(lua, &raw) {
            Ok(t) => Ok((Value::Table(t), None)),
            Err(e) => Ok((Value::Nil, Some(e.to_string()))),
        })?,
    )?;
    m.set(
        "build",
        lua.create_function(|_, t: Table| build(&t))?,
    )?;
    m.set(
        "build_query_string",
        lua.create_function(|_, t: Table| build_query_string(&t))?,
    )?;
    m.set(
        "resolve",
        lua.create_function(|_, (base, reference): (String, String)| {
            match Url::parse(&base).and_then(|b| b.join(&reference)) {
                Ok(u) => Ok((Some(u.to_string()), None)),
                Err(e) => Ok((None, Some(e.to_string()))),
            }
        })?,
    )?;

    Ok(m)
}
