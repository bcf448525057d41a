//! Key extraction for arbitrary Redis commands.
//!
//! Routing a replicated command requires knowing which keys it touches. A
//! static table maps command names to a key-position descriptor
//! (first-key index, last-key index, step), the same shape `COMMAND`
//! reports; `EVAL`-family commands read their explicit numkeys argument.
//! Unknown or keyless commands yield no keys and route to the default lane.

use std::collections::HashMap;
use std::sync::LazyLock;

use bytes::Bytes;

/// Key positions within a command's argv.
#[derive(Debug, Clone, Copy)]
struct KeySpec {
    /// Index of the first key argument.
    first: usize,
    /// Index of the last key argument; `-1` means the final argument.
    last: isize,
    /// Distance between key arguments.
    step: usize,
}

const fn spec(first: usize, last: isize, step: usize) -> KeySpec {
    KeySpec { first, last, step }
}

static KEY_TABLE: LazyLock<HashMap<&'static str, KeySpec>> = LazyLock::new(|| {
    let mut t = HashMap::new();
    // Single-key commands: (1, 1, 1).
    for cmd in [
        "APPEND",
        "DECR",
        "DECRBY",
        "DUMP",
        "EXPIRE",
        "EXPIREAT",
        "GET",
        "GETDEL",
        "GETEX",
        "GETRANGE",
        "GETSET",
        "HDEL",
        "HINCRBY",
        "HINCRBYFLOAT",
        "HMSET",
        "HSET",
        "HSETNX",
        "INCR",
        "INCRBY",
        "INCRBYFLOAT",
        "GEOADD",
        "LINSERT",
        "LPOP",
        "LPUSH",
        "LPUSHX",
        "LREM",
        "LSET",
        "LTRIM",
        "MOVE",
        "PERSIST",
        "PEXPIRE",
        "PEXPIREAT",
        "PFADD",
        "PSETEX",
        "RESTORE",
        "RPOP",
        "RPUSH",
        "RPUSHX",
        "SADD",
        "SET",
        "SETBIT",
        "SETEX",
        "SETNX",
        "SETRANGE",
        "SORT",
        "SPOP",
        "SREM",
        "XADD",
        "XDEL",
        "XSETID",
        "XTRIM",
        "ZADD",
        "ZINCRBY",
        "ZPOPMAX",
        "ZPOPMIN",
        "ZREM",
        "ZREMRANGEBYLEX",
        "ZREMRANGEBYRANK",
        "ZREMRANGEBYSCORE",
        "BITFIELD",
    ] {
        t.insert(cmd, spec(1, 1, 1));
    }
    // Two-key commands: (1, 2, 1).
    for cmd in ["COPY", "LMOVE", "RENAME", "RENAMENX", "RPOPLPUSH", "SMOVE"] {
        t.insert(cmd, spec(1, 2, 1));
    }
    // All trailing args are keys: (1, -1, 1).
    for cmd in [
        "DEL",
        "EXISTS",
        "PFCOUNT",
        "PFMERGE",
        "SDIFFSTORE",
        "SINTERSTORE",
        "SUNIONSTORE",
        "UNLINK",
    ] {
        t.insert(cmd, spec(1, -1, 1));
    }
    // Alternating key/value pairs: (1, -1, 2).
    for cmd in ["MSET", "MSETNX"] {
        t.insert(cmd, spec(1, -1, 2));
    }
    t
});

/// Commands whose key count is an explicit numkeys argument at argv[2].
const NUMKEYS_COMMANDS: [&str; 4] = ["EVAL", "EVALSHA", "FCALL", "FCALL_RO"];

/// Extract the keys a command touches, in argv order.
///
/// Returns an empty vec for keyless and unknown commands.
pub fn command_keys(argv: &[Bytes]) -> Vec<Bytes> {
    let Some(name) = argv.first() else {
        return Vec::new();
    };
    let name = name.to_ascii_uppercase();
    let Ok(name) = std::str::from_utf8(&name) else {
        return Vec::new();
    };

    if NUMKEYS_COMMANDS.contains(&name) {
        return numkeys_keys(argv);
    }

    let Some(spec) = KEY_TABLE.get(name) else {
        return Vec::new();
    };
    let last = if spec.last < 0 {
        argv.len().saturating_sub(1)
    } else {
        (spec.last as usize).min(argv.len().saturating_sub(1))
    };
    let mut keys = Vec::new();
    let mut i = spec.first;
    while i <= last && i < argv.len() {
        keys.push(argv[i].clone());
        i += spec.step;
    }
    keys
}

fn numkeys_keys(argv: &[Bytes]) -> Vec<Bytes> {
    let Some(numkeys) = argv.get(2) else {
        return Vec::new();
    };
    let Some(n) = std::str::from_utf8(numkeys)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
    else {
        return Vec::new();
    };
    argv.iter().skip(3).take(n).cloned().collect()
}
