//! `crypto` 模块：摘要、HMAC、base64/hex 编解码
//!
//! 摘要类函数默认返回小写 hex，第二个参数为 true 时返回原始字节。

use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use mlua::{Lua, Table, Value};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

fn hmac_with<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_by_name(method: &str, key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    match method.to_ascii_lowercase().as_str() {
        "md5" => Some(hmac_with::<Hmac<Md5>>(key, data)),
        "sha1" => Some(hmac_with::<Hmac<Sha1>>(key, data)),
        "sha256" => Some(hmac_with::<Hmac<Sha256>>(key, data)),
        "sha512" => Some(hmac_with::<Hmac<Sha512>>(key, data)),
        _ => None,
    }
}

/// hex 或原始字节
fn output(lua: &Lua, bytes: Vec<u8>, raw: Option<bool>) -> mlua::Result<Value> {
    if raw.unwrap_or(false) {
        Ok(Value::String(lua.create_string(&bytes)?))
    } else {
        Ok(Value::String(lua.create_string(hex_encode(&bytes))?))
    }
}

fn register_digest<D: Digest + 'static>(lua: &Lua, m: &Table, name: &str) -> mlua::Result<()> {
    let f = lua.create_function(|lua, (data, raw): (mlua::String, Option<bool>)| {
        output(lua, D::digest(data.as_bytes().to_vec()).to_vec(), raw)
    })?;
    m.set(name, f)
}

pub fn open(lua: &Lua) -> mlua::Result<Table> {
    let m = lua.create_table()?;

    register_digest::<Md5>(lua, &m, "md5")?;
    register_digest::<Sha1>(lua, &m, "sha1")?;
    register_digest::<Sha256>(lua, &m, "sha256")?;
    register_digest::<Sha512>(lua, &m, "sha512")?;

    m.set(
        "hmac",
        lua.create_function(
            |lua, (method, data, key, raw): (String, mlua::String, mlua::String, Option<bool>)| {
                match hmac_by_name(&method, &key.as_bytes().to_vec(), &data.as_bytes().to_vec()) {
                    Some(mac) => Ok((output(lua, mac, raw)?, None)),
                    None => Ok((Value::Nil, Some(format!("unsupported hmac method: {}", method)))),
                }
            },
        )?,
    )?;

    m.set(
        "base64_encode",
        lua.create_function(|_, data: mlua::String| {
            Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes().to_vec()))
        })?,
    )?;
    m.set(
        "base64_decode",
        lua.create_function(|lua, data: String| {
            match base64::engine::general_purpose::STANDARD.decode(data.trim()) {
                Ok(bytes) => Ok((Value::String(lua.create_string(&bytes)?), None)),
                Err(e) => Ok((Value::Nil, Some(e.to_string()))),
            }
        })?,
    )?;
    m.set(
        "hex_encode",
        lua.create_function(|_, data: mlua::String| Ok(hex_encode(&data.as_bytes().to_vec())))?,
    )?;
    m.set(
        "hex_decode",
        lua.create_function(|lua, data: String| match hex_decode(&data) {
            Some(bytes) => Ok((Value::String(lua.create_string(&bytes)?), None)),
            None => Ok((Value::Nil, Some("invalid hex string".to_string()))),
        })?,
    )?;

    Ok(m)
}
