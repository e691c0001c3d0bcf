//! 脚本包（bundle）解析
//!
//! 一个脚本包就是一个目录，其中包含入口文件 `entry.lua`（源码）
//! 或 `entry.luc`（预编译字节码），源码优先。

use std::path::{Path, PathBuf};

use crate::common::error::{Result, ScriptError};

/// 入口文件基名
pub const ENTRY_STEM: &str = "entry";

/// 入口文件形态，按探测优先级排列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `.lua` 源码
    Source,
    /// `.luc` 预编译字节码
    Compiled,
}

impl EntryKind {
    pub const PROBE_ORDER: [EntryKind; 2] = [EntryKind::Source, EntryKind::Compiled];

    pub fn extension(self) -> &'static str {
        match self {
            EntryKind::Source => "lua",
            EntryKind::Compiled => "luc",
        }
    }
}

/// 已解析的脚本包，解析后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    dir: PathBuf,
    entry: PathBuf,
    kind: EntryKind,
}

impl Bundle {
    /// 探测 `path` 是否为脚本包。路径不存在、不是目录或缺少入口文件时返回 `None`。
    pub fn resolve(path: impl AsRef<Path>) -> Option<Self> {
        let dir = path.as_ref();
        if !dir.is_dir() {
            return None;
        }
        EntryKind::PROBE_ORDER.iter().find_map(|kind| {
            let entry = dir.join(format!("{}.{}", ENTRY_STEM, kind.extension()));
            entry.is_file().then(|| Bundle {
                dir: dir.to_path_buf(),
                entry,
                kind: *kind,
            })
        })
    }

    /// 同 [`Bundle::resolve`]，但把“不是脚本包”变成错误
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::resolve(path).ok_or_else(|| ScriptError::NotABundle(path.to_path_buf()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry(&self) -> &Path {
        &self.entry
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    /// 包内模块搜索路径：`?.lua`、`?.luc`、`?/init.lua`、`?/init.luc`
    pub fn search_path(&self) -> String {
        ["?.lua", "?.luc", "?/init.lua", "?/init.luc"]
            .iter()
            .map(|pattern| self.dir.join(pattern).to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// `(是否为脚本包, 入口路径)`，不是脚本包时入口为空路径
pub fn is_bundle(path: impl AsRef<Path>) -> (bool, PathBuf) {
    match Bundle::resolve(path) {
        Some(bundle) => (true, bundle.entry),
        None => (false, PathBuf::new()),
    }
}
