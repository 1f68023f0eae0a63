//! Command Handler
//!
//! Executes parsed requests against the [`Keyspace`] and produces the
//! [`WireValue`] to send back. Names are matched case-insensitively.
//!
//! ## Supported Commands
//!
//! ### Scalar Commands
//! - `get key` - Value as STR/INT/DBL, or NIL
//! - `set key value` - Store a string, keeping any TTL
//! - `del key` - Delete a key
//! - `keys` - Every key
//! - `incrby key delta` - Integer add
//! - `incrbyfloat key delta` - Double add
//!
//! ### Expiration Commands
//! - `pexpire key ms` - Set a TTL; negative clears it
//! - `pttl key` - Remaining TTL (-2 absent, -1 none)
//! - `persist key` - Clear the TTL
//!
//! ### Sorted Set Commands
//! - `zadd key score name` - Add or rescore a member
//! - `zrem key name` - Remove a member
//! - `zscore key name` - Score of a member
//! - `zrank key name` - Zero-based rank of a member
//! - `zquery key score name offset limit` - Range query by `(score, name)`
//!
//! ### Server Commands
//! - `ping [message]`
//! - `dbsize`
//!
//! ## Errors
//!
//! Failures are returned as `ERR` values and never close the connection:
//!
//! | Code      | Meaning                                  |
//! |-----------|------------------------------------------|
//! | `UNKNOWN` | Unknown command                          |
//! | `TYPE`    | Command does not apply to the value type |
//! | `ARG`     | Wrong arity or malformed number          |

use crate::protocol::{err_code, WireValue};
use crate::storage::{EntryId, Keyspace, Value, ZSet};
use bytes::Bytes;
use tracing::trace;

type CmdResult = Result<WireValue, WireValue>;

fn arity_error(cmd: &str) -> WireValue {
    WireValue::err(
        err_code::ARG,
        format!("wrong number of arguments for '{}' command", cmd),
    )
}

fn type_error(expected: &str, found: &Value) -> WireValue {
    WireValue::err(
        err_code::TYPE,
        format!("expect {}, found {}", expected, found.type_name()),
    )
}

fn parse_int(arg: &[u8]) -> Result<i64, WireValue> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WireValue::err(err_code::ARG, "expect int"))
}

fn parse_float(arg: &[u8]) -> Result<f64, WireValue> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|d| !d.is_nan())
        .ok_or_else(|| WireValue::err(err_code::ARG, "expect float"))
}

/// Executes commands against a keyspace at a fixed point in time.
///
/// A handler is built per request by the event loop; `now_ms` is the loop's
/// monotonic clock reading for the current iteration.
pub struct CommandHandler<'a> {
    keyspace: &'a mut Keyspace,
    now_ms: u64,
}

impl<'a> CommandHandler<'a> {
    pub fn new(keyspace: &'a mut Keyspace, now_ms: u64) -> Self {
        Self { keyspace, now_ms }
    }

    /// Executes one request and returns the response.
    ///
    /// # Example
    ///
    /// ```
    /// use bytes::Bytes;
    /// use tidekv::commands::CommandHandler;
    /// use tidekv::pool::DisposalPool;
    /// use tidekv::protocol::WireValue;
    /// use tidekv::storage::{HashIndex, Keyspace};
    ///
    /// let mut ks = Keyspace::new(HashIndex::new(), DisposalPool::new(1).unwrap());
    /// let mut handler = CommandHandler::new(&mut ks, 0);
    ///
    /// let args = [Bytes::from("set"), Bytes::from("k"), Bytes::from("v")];
    /// assert_eq!(handler.execute(&args), WireValue::nil());
    /// ```
    pub fn execute(&mut self, args: &[Bytes]) -> WireValue {
        let Some((name, rest)) = args.split_first() else {
            return WireValue::err(err_code::UNKNOWN, "empty command");
        };
        let cmd = String::from_utf8_lossy(name).to_ascii_lowercase();
        trace!(cmd = %cmd, args = rest.len(), "Executing command");

        self.dispatch(&cmd, rest).unwrap_or_else(|err| err)
    }

    fn dispatch(&mut self, cmd: &str, args: &[Bytes]) -> CmdResult {
        match cmd {
            // Scalar commands
            "get" => self.cmd_get(args),
            "set" => self.cmd_set(args),
            "del" => self.cmd_del(args),
            "keys" => self.cmd_keys(args),
            "incrby" => self.cmd_incrby(args),
            "incrbyfloat" => self.cmd_incrbyfloat(args),

            // Expiration commands
            "pexpire" => self.cmd_pexpire(args),
            "pttl" => self.cmd_pttl(args),
            "persist" => self.cmd_persist(args),

            // Sorted set commands
            "zadd" => self.cmd_zadd(args),
            "zrem" => self.cmd_zrem(args),
            "zscore" => self.cmd_zscore(args),
            "zrank" => self.cmd_zrank(args),
            "zquery" => self.cmd_zquery(args),

            // Server commands
            "ping" => self.cmd_ping(args),
            "dbsize" => self.cmd_dbsize(args),

            _ => Err(WireValue::err(
                err_code::UNKNOWN,
                format!("unknown command '{}'", cmd),
            )),
        }
    }

    fn check_arity(cmd: &str, args: &[Bytes], expected: usize) -> Result<(), WireValue> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(arity_error(cmd))
        }
    }

    fn value_mut(&mut self, id: EntryId) -> Option<&mut Value> {
        self.keyspace.entry_mut(id).map(|e| &mut e.value)
    }

    /// The sorted set stored at `key`, if any.
    fn zset(&mut self, key: &[u8]) -> Result<Option<&mut ZSet>, WireValue> {
        let Some(id) = self.keyspace.lookup(key) else {
            return Ok(None);
        };
        match self.value_mut(id) {
            Some(Value::ZSet(zset)) => Ok(Some(&mut **zset)),
            Some(other) => Err(type_error("zset", other)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Scalar Commands
    // ========================================================================

    /// get key
    fn cmd_get(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("get", args, 1)?;
        let Some(id) = self.keyspace.lookup(&args[0]) else {
            return Ok(WireValue::nil());
        };
        match self.keyspace.entry(id).map(|e| &e.value) {
            Some(Value::Str(data)) => Ok(WireValue::str(data.clone())),
            Some(Value::Int(n)) => Ok(WireValue::int(*n)),
            Some(Value::Dbl(d)) => Ok(WireValue::dbl(*d)),
            Some(other @ Value::ZSet(_)) => Err(type_error("string", other)),
            None => Ok(WireValue::nil()),
        }
    }

    /// set key value
    fn cmd_set(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("set", args, 2)?;
        let value = args[1].clone();

        match self.keyspace.lookup(&args[0]) {
            Some(id) => match self.value_mut(id) {
                Some(slot) if matches!(slot, Value::ZSet(_)) => {
                    return Err(type_error("string", slot))
                }
                Some(slot) => *slot = Value::Str(value),
                None => {}
            },
            None => {
                self.keyspace.insert(args[0].clone(), Value::Str(value));
            }
        }
        Ok(WireValue::nil())
    }

    /// del key
    fn cmd_del(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("del", args, 1)?;
        Ok(WireValue::int(self.keyspace.delete(&args[0]) as i64))
    }

    /// keys
    fn cmd_keys(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("keys", args, 0)?;
        Ok(WireValue::arr(
            self.keyspace.keys().into_iter().map(WireValue::Str).collect(),
        ))
    }

    /// incrby key delta
    fn cmd_incrby(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("incrby", args, 2)?;
        let delta = parse_int(&args[1])?;

        let Some(id) = self.keyspace.lookup(&args[0]) else {
            self.keyspace.insert(args[0].clone(), Value::Int(delta));
            return Ok(WireValue::int(delta));
        };

        let Some(slot) = self.value_mut(id) else {
            return Ok(WireValue::nil());
        };
        let current = match &*slot {
            Value::Int(n) => *n,
            Value::Str(data) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| type_error("int", &*slot))?,
            other => return Err(type_error("int", other)),
        };

        let next = current
            .checked_add(delta)
            .ok_or_else(|| WireValue::err(err_code::ARG, "increment would overflow"))?;
        *slot = Value::Int(next);
        Ok(WireValue::int(next))
    }

    /// incrbyfloat key delta
    fn cmd_incrbyfloat(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("incrbyfloat", args, 2)?;
        let delta = parse_float(&args[1])?;

        let Some(id) = self.keyspace.lookup(&args[0]) else {
            self.keyspace.insert(args[0].clone(), Value::Dbl(delta));
            return Ok(WireValue::dbl(delta));
        };

        let Some(slot) = self.value_mut(id) else {
            return Ok(WireValue::nil());
        };
        let current = match &*slot {
            Value::Dbl(d) => *d,
            Value::Int(n) => *n as f64,
            Value::Str(data) => std::str::from_utf8(data)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|d| !d.is_nan())
                .ok_or_else(|| type_error("float", &*slot))?,
            other @ Value::ZSet(_) => return Err(type_error("float", other)),
        };

        let next = current + delta;
        if next.is_nan() {
            return Err(WireValue::err(err_code::ARG, "increment would produce NaN"));
        }
        *slot = Value::Dbl(next);
        Ok(WireValue::dbl(next))
    }

    // ========================================================================
    // Expiration Commands
    // ========================================================================

    /// pexpire key ms
    fn cmd_pexpire(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("pexpire", args, 2)?;
        let ttl_ms = parse_int(&args[1])?;

        match self.keyspace.lookup(&args[0]) {
            Some(id) => {
                self.keyspace.set_ttl(id, ttl_ms, self.now_ms);
                Ok(WireValue::int(1))
            }
            None => Ok(WireValue::int(0)),
        }
    }

    /// pttl key
    fn cmd_pttl(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("pttl", args, 1)?;
        let Some(id) = self.keyspace.lookup(&args[0]) else {
            return Ok(WireValue::int(-2));
        };
        let remaining = self
            .keyspace
            .ttl_remaining(id, self.now_ms)
            .map_or(-1, |ms| ms as i64);
        Ok(WireValue::int(remaining))
    }

    /// persist key
    fn cmd_persist(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("persist", args, 1)?;
        let removed = match self.keyspace.lookup(&args[0]) {
            Some(id) => self.keyspace.persist(id),
            None => false,
        };
        Ok(WireValue::int(removed as i64))
    }

    // ========================================================================
    // Sorted Set Commands
    // ========================================================================

    /// zadd key score name
    fn cmd_zadd(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("zadd", args, 3)?;
        let score = parse_float(&args[1])?;
        let name = args[2].clone();

        if let Some(zset) = self.zset(&args[0])? {
            return Ok(WireValue::int(zset.insert(name, score) as i64));
        }

        let mut zset = ZSet::new();
        zset.insert(name, score);
        self.keyspace
            .insert(args[0].clone(), Value::ZSet(Box::new(zset)));
        Ok(WireValue::int(1))
    }

    /// zrem key name
    fn cmd_zrem(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("zrem", args, 2)?;
        let removed = match self.zset(&args[0])? {
            Some(zset) => zset.remove(&args[1]),
            None => false,
        };
        Ok(WireValue::int(removed as i64))
    }

    /// zscore key name
    fn cmd_zscore(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("zscore", args, 2)?;
        let score = self.zset(&args[0])?.and_then(|zset| zset.score(&args[1]));
        Ok(score.map_or_else(WireValue::nil, WireValue::dbl))
    }

    /// zrank key name
    fn cmd_zrank(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("zrank", args, 2)?;
        let rank = self.zset(&args[0])?.and_then(|zset| zset.rank(&args[1]));
        Ok(rank.map_or_else(WireValue::nil, |r| WireValue::int(r as i64)))
    }

    /// zquery key score name offset limit
    fn cmd_zquery(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("zquery", args, 5)?;
        let score = parse_float(&args[1])?;
        let name = &args[2];
        let offset = parse_int(&args[3])?;
        let limit = parse_int(&args[4])?;
        let limit = usize::try_from(limit)
            .map_err(|_| WireValue::err(err_code::ARG, "expect non-negative limit"))?;

        let Some(zset) = self.zset(&args[0])? else {
            return Ok(WireValue::arr(Vec::new()));
        };

        let mut out = Vec::new();
        for member in zset.query(score, name, offset, limit) {
            out.push(WireValue::str(member.name.clone()));
            out.push(WireValue::dbl(member.score));
        }
        Ok(WireValue::arr(out))
    }

    // ========================================================================
    // Server Commands
    // ========================================================================

    /// ping [message]
    fn cmd_ping(&mut self, args: &[Bytes]) -> CmdResult {
        match args {
            [] => Ok(WireValue::str(Bytes::from_static(b"PONG"))),
            [msg] => Ok(WireValue::str(msg.clone())),
            _ => Err(arity_error("ping")),
        }
    }

    /// dbsize
    fn cmd_dbsize(&mut self, args: &[Bytes]) -> CmdResult {
        Self::check_arity("dbsize", args, 0)?;
        Ok(WireValue::int(self.keyspace.len() as i64))
    }
}
