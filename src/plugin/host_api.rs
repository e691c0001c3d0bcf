//! 宿主暴露给脚本的原生函数
//!
//! 以 `ext` 模块的形式预加载进每个解释器实例：
//!
//! ```lua
//! local ext = require "ext"
//! local body = ext.sync_http_get("http://example.com/list.txt") -- 失败时为 nil
//! ext.async_http_get("http://collector.local/beacon")            -- 立即返回
//! print(ext.name, ext.script_dir)
//! ```
//!
//! 导出表是进程级只读的；HTTP 后端 [`HostHttp`] 由所有实例通过 `Arc` 共享。

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mlua::{Lua, Table, Value};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tracing::{debug, warn};

use crate::config::types::HttpConfig;

/// 模块名
pub const EXT_MODULE: &str = "ext";
/// `ext.name` 的固定值
pub const EXT_DISPLAY_NAME: &str = "luagate host extension";

type ExtFn = fn(&Lua, &HostHttp, String) -> mlua::Result<Value>;

/// 导出函数表，初始化后不再修改
pub static EXPORTS: &[(&str, ExtFn)] = &[
    ("sync_http_get", sync_http_get),
    ("async_http_get", async_http_get),
];

/// 脚本侧 HTTP 能力的共享后端
pub struct HostHttp {
    timeout: Duration,
    user_agent: String,
    /// 阻塞客户端在第一次同步请求时才创建，避免在异步上下文中构造/析构
    blocking: OnceLock<Option<reqwest::blocking::Client>>,
    /// 后台请求用，不设超时、不复用连接
    background: Option<reqwest::Client>,
    runtime: Option<Handle>,
}

impl HostHttp {
    /// 捕获当前 tokio 运行时（如果有），后台请求会派发到该运行时上
    pub fn new(config: &HttpConfig) -> Self {
        let background = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| warn!(error = %e, "failed to build background http client"))
            .ok();

        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            user_agent: config.user_agent.clone(),
            blocking: OnceLock::new(),
            background,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn with_runtime(mut self, runtime: Option<Handle>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 同步请求使用的客户端；构建失败时为 `None`
    pub fn blocking_client(&self) -> Option<&reqwest::blocking::Client> {
        self.blocking
            .get_or_init(|| {
                reqwest::blocking::Client::builder()
                    .user_agent(self.user_agent.clone())
                    .timeout(self.timeout)
                    .build()
                    .map_err(|e| warn!(error = %e, "failed to build blocking http client"))
                    .ok()
            })
            .as_ref()
    }

    /// 用阻塞客户端执行 `f`，调用线程在 tokio 运行时内时同样安全：
    /// 多线程运行时的 worker 上走 `block_in_place`，current-thread 运行时上
    /// 转到一个临时线程执行并等待结果。客户端不可用或辅助线程 panic 时返回 `None`。
    pub fn with_blocking<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&reqwest::blocking::Client) -> R + Send,
        R: Send,
    {
        let run = || self.blocking_client().map(f);
        match Handle::try_current() {
            Err(_) => run(),
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(run)
            }
            Ok(_) => std::thread::scope(|s| s.spawn(run).join()).unwrap_or_else(|_| {
                warn!("sync http helper thread panicked");
                None
            }),
        }
    }

    /// 同步 GET，返回完整响应体；网络错误、读取失败或空响应体都返回 `None`
    pub fn get_body(&self, url: &str) -> Option<Vec<u8>> {
        self.with_blocking(|client| {
            let resp = match client.get(url).send() {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(url = url, error = %e, "sync_http_get failed");
                    return None;
                }
            };
            match resp.bytes() {
                Ok(body) if !body.is_empty() => Some(body.to_vec()),
                Ok(_) => None,
                Err(e) => {
                    debug!(url = url, error = %e, "sync_http_get body read failed");
                    None
                }
            }
        })
        .flatten()
    }

    /// 后台 GET，立即返回。结果与错误都被丢弃，没有超时也没有取消。
    pub fn spawn_get(&self, url: String) {
        let Some(client) = self.background.clone() else {
            return;
        };
        let handle = self
            .runtime
            .clone()
            .or_else(|| fallback_runtime().map(|rt| rt.handle().clone()));
        let Some(handle) = handle else {
            return;
        };
        handle.spawn(async move {
            let _ = client.get(&url).send().await;
        });
    }
}

/// 没有宿主运行时时后台请求共用的运行时，第一次使用时创建
fn fallback_runtime() -> Option<&'static Runtime> {
    static FALLBACK: OnceLock<Option<Runtime>> = OnceLock::new();
    FALLBACK
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("ext-async-get")
                .enable_all()
                .build()
                .map_err(|e| warn!(error = %e, "failed to build fallback runtime for async_http_get"))
                .ok()
        })
        .as_ref()
}

fn sync_http_get(lua: &Lua, http: &HostHttp, url: String) -> mlua::Result<Value> {
    match http.get_body(&url) {
        Some(body) => Ok(Value::String(lua.create_string(&body)?)),
        None => Ok(Value::Nil),
    }
}

fn async_http_get(_lua: &Lua, http: &HostHttp, url: String) -> mlua::Result<Value> {
    http.spawn_get(url);
    Ok(Value::Nil)
}

/// 构造 `ext` 模块表。`script_dir` 是拥有该实例的脚本包目录。
pub fn build_ext_module(lua: &Lua, http: &Arc<HostHttp>, script_dir: &Path) -> mlua::Result<Table> {
    let module = lua.create_table()?;
    for (name, func) in EXPORTS {
        let http = Arc::clone(http);
        let func = *func;
        let bound = lua.create_function(move |lua, url: Option<String>| {
            func(lua, &http, url.unwrap_or_default())
        })?;
        module.set(*name, bound)?;
    }
    module.set("name", EXT_DISPLAY_NAME)?;
    module.set("script_dir", script_dir.to_string_lossy().into_owned())?;
    Ok(module)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    /// 起一个只服务一次的回环 HTTP 服务，返回 URL
    pub fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                read_request_head(&mut stream);
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes());
            }
        });
        format!("http://{}/", addr)
    }

    /// 接收请求后挂起 `hold`，不回应；请求到达时通过通道通知
    pub fn serve_stalled(hold: Duration) -> (String, mpsc::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                read_request_head(&mut stream);
                let _ = tx.send(());
                std::thread::sleep(hold);
            }
        });
        (format!("http://{}/beacon", addr), rx)
    }

    /// 读完请求头和 Content-Length 指定的请求体
    fn read_request_head(stream: &mut std::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 512];
        let head_end = loop {
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
        let body_len = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let mut have = buf.len() - head_end;
        while have < body_len {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(n) => have += n,
            }
        }
    }
}
