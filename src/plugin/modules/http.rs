//! `http` 模块：完整的同步 HTTP 请求
//!
//! ```lua
//! local http = require "http"
//! local resp, err = http.get("http://example.com/", { query = "a=1", headers = { Accept = "text/plain" } })
//! if resp then print(resp.status_code, resp.body) end
//! ```
//!
//! 出错时返回 `nil, 错误信息`，不会向脚本抛异常。

use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, Table, Value};
use reqwest::Method;

use crate::plugin::host_api::HostHttp;

/// 脚本传入的请求选项
#[derive(Debug, Default)]
struct RequestOptions {
    query: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    form: Option<String>,
    timeout: Option<Duration>,
}

impl RequestOptions {
    fn from_lua(opts: Option<Table>) -> mlua::Result<Self> {
        let Some(opts) = opts else {
            return Ok(Self::default());
        };
        let mut parsed = Self {
            query: opts.get("query")?,
            form: opts.get("form")?,
            ..Default::default()
        };
        if let Some(body) = opts.get::<Option<mlua::String>>("body")? {
            parsed.body = Some(body.as_bytes().to_vec());
        }
        if let Some(headers) = opts.get::<Option<Table>>("headers")? {
            for entry in headers.pairs::<String, String>() {
                parsed.headers.push(entry?);
            }
        }
        if let Some(secs) = opts.get::<Option<f64>>("timeout")? {
            if secs > 0.0 {
                parsed.timeout = Some(Duration::from_secs_f64(secs));
            }
        }
        Ok(parsed)
    }
}

/// 已读完的响应，跨线程传回后再转成 Lua 表
struct RawResponse {
    status: u16,
    url: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

fn fetch(
    client: &reqwest::blocking::Client,
    method: Method,
    url: String,
    opts: RequestOptions,
) -> Result<RawResponse, String> {
    let mut req = client.request(method, &url);
    for (name, value) in &opts.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    if let Some(form) = opts.form {
        req = req
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(form);
    } else if let Some(body) = opts.body {
        req = req.body(body);
    }
    if let Some(timeout) = opts.timeout {
        req = req.timeout(timeout);
    }

    let resp = req.send().map_err(|e| e.to_string())?;
    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let headers = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();
    let body = resp.bytes().map_err(|e| e.to_string())?.to_vec();
    Ok(RawResponse {
        status,
        url,
        headers,
        body,
    })
}

fn perform(
    lua: &Lua,
    http: &HostHttp,
    method: &str,
    url: &str,
    opts: RequestOptions,
) -> Result<Table, String> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| format!("invalid method: {}", e))?;

    let mut target = url.to_string();
    if let Some(query) = opts.query.as_deref().filter(|q| !q.is_empty()) {
        target.push(if target.contains('?') { '&' } else { '?' });
        target.push_str(query);
    }

    let raw = http
        .with_blocking(move |client| fetch(client, method, target, opts))
        .ok_or_else(|| "http client unavailable".to_string())??;

    let build = || -> mlua::Result<Table> {
        let t = lua.create_table()?;
        t.set("status_code", raw.status)?;
        t.set("body", lua.create_string(&raw.body)?)?;
        t.set("body_size", raw.body.len())?;
        t.set("url", raw.url.as_str())?;
        let h = lua.create_table()?;
        for (k, v) in &raw.headers {
            h.set(k.as_str(), v.as_str())?;
        }
        t.set("headers", h)?;
        Ok(t)
    };
    build().map_err(|e| e.to_string())
}

fn respond(result: Result<Table, String>) -> (Value, Option<String>) {
    match result {
        Ok(t) => (Value::Table(t), None),
        Err(e) => (Value::Nil, Some(e)),
    }
}

pub fn open(lua: &Lua, http: &Arc<HostHttp>) -> mlua::Result<Table> {
    let m = lua.create_table()?;

    for method in ["get", "post", "put", "patch", "delete", "head"] {
        let http = Arc::clone(http);
        let f = lua.create_function(move |lua, (url, opts): (String, Option<Table>)| {
            let opts = RequestOptions::from_lua(opts)?;
            Ok(respond(perform(lua, &http, method, &url, opts)))
        })?;
        m.set(method, f)?;
    }

    let http = Arc::clone(http);
    m.set(
        "request",
        lua.create_function(
            move |lua, (method, url, opts): (String, String, Option<Table>)| {
                let opts = RequestOptions::from_lua(opts)?;
                Ok(respond(perform(lua, &http, &method, &url, opts)))
            },
        )?,
    )?;

    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::HttpConfig;
    use crate::plugin::host_api::test_support::serve_once;

    fn lua_with_http() -> Lua {
        let lua = Lua::new();
        let http = Arc::new(HostHttp::new(&HttpConfig {
            timeout_secs: 5,
            ..Default::default()
        }));
        lua.globals().set("http", open(&lua, &http).unwrap()).unwrap();
        lua
    }

    #[test]
    fn get_returns_response_table() {
        let lua = lua_with_http();
        lua.globals().set("target", serve_once("pong")).unwrap();
        let resp: Table = lua.load("return http.get(target)").eval().unwrap();
        assert_eq!(resp.get::<u16>("status_code").unwrap(), 200);
        assert_eq!(resp.get::<String>("body").unwrap(), "pong");
        assert_eq!(resp.get::<usize>("body_size").unwrap(), 4);
        let headers: Table = resp.get("headers").unwrap();
        assert_eq!(headers.get::<String>("content-length").unwrap(), "4");
    }

    #[test]
    fn request_with_method_and_options() {
        let lua = lua_with_http();
        lua.globals().set("target", serve_once("ok")).unwrap();
        let status: u16 = lua
            .load(
                r#"
                local resp = http.request("POST", target, { form = "a=1", query = "x=2", timeout = 3 })
                return resp.status_code
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(status, 200);
    }

    #[test]
    fn connection_error_returns_nil_and_message() {
        let lua = lua_with_http();
        let (v, err): (Value, String) = lua
            .load("return http.get('http://127.0.0.1:1/')")
            .eval()
            .unwrap();
        assert!(v.is_nil());
        assert!(!err.is_empty());
    }

    #[test]
    fn invalid_method_is_reported() {
        let lua = lua_with_http();
        let (v, err): (Value, String) = lua
            .load("return http.request('NOT A METHOD', 'http://127.0.0.1:1/')")
            .eval()
            .unwrap();
        assert!(v.is_nil());
        assert!(err.contains("invalid method"));
    }
}
