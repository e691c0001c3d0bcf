//! 配置文本中的环境变量展开
//!
//! 支持 `${VAR}`、`${VAR:-default}` 和 `$VAR`，未定义的变量展开为空串，
//! `$$` 转义为字面量 `$`。

fn lookup(name: &str) -> String {
    if let Some((name, default)) = name.split_once(":-") {
        return match std::env::var(name) {
            Ok(val) if !val.is_empty() => val,
            _ => default.to_string(),
        };
    }
    std::env::var(name).unwrap_or_default()
}

pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    out.push_str(&lookup(&braced[..end]));
                    rest = &braced[end + 1..];
                }
                None => {
                    // 没有闭合括号，原样保留
                    out.push_str(&rest[pos..]);
                    rest = "";
                }
            }
        } else {
            let len = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            if len == 0 {
                out.push('$');
            } else {
                out.push_str(&lookup(&after[..len]));
            }
            rest = &after[len..];
        }
    }
    out.push_str(rest);
    out
}
