//! `bit32` 模块：Lua 5.2 语义的 32 位无符号位运算（Lua 5.4 已移除该库）

use mlua::{Lua, Number, Table, Variadic};

const ALL_ONES: u32 = u32::MAX;

fn to_u32(n: Number) -> u32 {
    n.floor().rem_euclid(4_294_967_296.0) as u32
}

/// 位移量超过 ±32 的效果都一样，夹到 ±64 以免溢出
fn to_disp(n: Number) -> i64 {
    n.floor().clamp(-64.0, 64.0) as i64
}

fn to_rotation(n: Number) -> u32 {
    n.floor().rem_euclid(32.0) as u32
}

/// 正数左移、负数右移，移出 32 位即为 0
fn shift(x: u32, disp: i64) -> u32 {
    if disp <= -32 || disp >= 32 {
        0
    } else if disp >= 0 {
        x << disp
    } else {
        x >> -disp
    }
}

fn arshift(x: u32, disp: i64) -> u32 {
    if disp < 0 {
        return shift(x, -disp);
    }
    if disp >= 32 {
        return if x & 0x8000_0000 != 0 { ALL_ONES } else { 0 };
    }
    ((x as i32) >> disp) as u32
}

fn field_mask(field: i64, width: i64) -> mlua::Result<u32> {
    if field < 0 || width <= 0 || field + width > 32 {
        return Err(mlua::Error::RuntimeError(
            "trying to access non-existent bits".into(),
        ));
    }
    Ok(if width == 32 {
        ALL_ONES
    } else {
        (1u32 << width) - 1
    })
}

fn fold(args: Variadic<Number>, init: u32, op: fn(u32, u32) -> u32) -> u32 {
    args.iter().fold(init, |acc, n| op(acc, to_u32(*n)))
}

pub fn open(lua: &Lua) -> mlua::Result<Table> {
    let m = lua.create_table()?;

    m.set(
        "band",
        lua.create_function(|_, args: Variadic<Number>| {
            Ok(fold(args, ALL_ONES, |a, b| a & b) as i64)
        })?,
    )?;
    m.set(
        "bor",
        lua.create_function(|_, args: Variadic<Number>| Ok(fold(args, 0, |a, b| a | b) as i64))?,
    )?;
    m.set(
        "bxor",
        lua.create_function(|_, args: Variadic<Number>| Ok(fold(args, 0, |a, b| a ^ b) as i64))?,
    )?;
    m.set(
        "btest",
        lua.create_function(|_, args: Variadic<Number>| Ok(fold(args, ALL_ONES, |a, b| a & b) != 0))?,
    )?;
    m.set(
        "bnot",
        lua.create_function(|_, x: Number| Ok(!to_u32(x) as i64))?,
    )?;
    m.set(
        "lshift",
        lua.create_function(|_, (x, d): (Number, Number)| Ok(shift(to_u32(x), to_disp(d)) as i64))?,
    )?;
    m.set(
        "rshift",
        lua.create_function(|_, (x, d): (Number, Number)| {
            Ok(shift(to_u32(x), -to_disp(d)) as i64)
        })?,
    )?;
    m.set(
        "arshift",
        lua.create_function(|_, (x, d): (Number, Number)| Ok(arshift(to_u32(x), to_disp(d)) as i64))?,
    )?;
    m.set(
        "lrotate",
        lua.create_function(|_, (x, d): (Number, Number)| {
            Ok(to_u32(x).rotate_left(to_rotation(d)) as i64)
        })?,
    )?;
    m.set(
        "rrotate",
        lua.create_function(|_, (x, d): (Number, Number)| {
            Ok(to_u32(x).rotate_right(to_rotation(d)) as i64)
        })?,
    )?;
    m.set(
        "extract",
        lua.create_function(|_, (n, field, width): (Number, Number, Option<Number>)| {
            let field = to_disp(field);
            let mask = field_mask(field, width.map(to_disp).unwrap_or(1))?;
            Ok(((to_u32(n) >> field) & mask) as i64)
        })?,
    )?;
    m.set(
        "replace",
        lua.create_function(
            |_, (n, v, field, width): (Number, Number, Number, Option<Number>)| {
                let field = to_disp(field);
                let mask = field_mask(field, width.map(to_disp).unwrap_or(1))?;
                let cleared = to_u32(n) & !(mask << field);
                Ok((cleared | ((to_u32(v) & mask) << field)) as i64)
            },
        )?,
    )?;

    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_int(src: &str) -> i64 {
        let lua = Lua::new();
        lua.globals().set("bit32", open(&lua).unwrap()).unwrap();
        lua.load(src).eval().unwrap()
    }

    #[test]
    fn logical_ops() {
        assert_eq!(eval_int("return bit32.band(0xF0F0, 0xFF00)"), 0xF000);
        assert_eq!(eval_int("return bit32.bor(1, 2, 4)"), 7);
        assert_eq!(eval_int("return bit32.bxor(0xFF, 0x0F)"), 0xF0);
        assert_eq!(eval_int("return bit32.band()"), 0xFFFF_FFFF);
        assert_eq!(eval_int("return bit32.bnot(0)"), 0xFFFF_FFFF);
    }

    #[test]
    fn negative_inputs_wrap() {
        assert_eq!(eval_int("return bit32.band(-1)"), 0xFFFF_FFFF);
        assert_eq!(eval_int("return bit32.bor(2^32 + 5)"), 5);
    }

    #[test]
    fn shifts() {
        assert_eq!(eval_int("return bit32.lshift(1, 4)"), 16);
        assert_eq!(eval_int("return bit32.lshift(1, -1)"), 0);
        assert_eq!(eval_int("return bit32.rshift(0x80000000, 31)"), 1);
        assert_eq!(eval_int("return bit32.lshift(1, 32)"), 0);
        assert_eq!(eval_int("return bit32.arshift(0x80000000, 4)"), 0xF800_0000);
        assert_eq!(eval_int("return bit32.arshift(0x80000000, 40)"), 0xFFFF_FFFF);
        assert_eq!(eval_int("return bit32.arshift(0x40000000, 40)"), 0);
    }

    #[test]
    fn rotates() {
        assert_eq!(eval_int("return bit32.lrotate(0x80000001, 1)"), 3);
        assert_eq!(eval_int("return bit32.rrotate(3, 1)"), 0x8000_0001);
        assert_eq!(eval_int("return bit32.lrotate(5, 32)"), 5);
    }

    #[test]
    fn extract_and_replace() {
        assert_eq!(eval_int("return bit32.extract(0xABCD, 4, 8)"), 0xBC);
        assert_eq!(eval_int("return bit32.extract(2, 1)"), 1);
        assert_eq!(eval_int("return bit32.replace(0, 0xF, 8, 4)"), 0xF00);
        assert_eq!(eval_int("return bit32.replace(0xFFFF, 0, 0, 8)"), 0xFF00);
    }

    #[test]
    fn extract_out_of_range_raises() {
        let lua = Lua::new();
        lua.globals().set("bit32", open(&lua).unwrap()).unwrap();
        let err = lua
            .load("return bit32.extract(1, 30, 4)")
            .eval::<i64>()
            .unwrap_err();
        assert!(err.to_string().contains("non-existent bits"));
    }

    #[test]
    fn btest() {
        let lua = Lua::new();
        lua.globals().set("bit32", open(&lua).unwrap()).unwrap();
        assert!(lua.load("return bit32.btest(6, 2)").eval::<bool>().unwrap());
        assert!(!lua.load("return bit32.btest(4, 2)").eval::<bool>().unwrap());
    }
}
