use std::io::BufRead;
use std::mem;

use num_bigint::BigInt;

use crate::error::{Error, Result};
use crate::object::{ExtensionRegistry, ObjectModel, SymbolicModel};
use crate::opcodes::*;
use crate::read::{ByteSource, IoSource, SliceSource};
use crate::value::Value;
use crate::HIGHEST_PROTOCOL;

const MAX_MEMO_SIZE: usize = 100_000;
const MAX_LONG_DIGITS: usize = 10_000;

type PersistentLoadFn = Box<dyn Fn(Value) -> Result<Value>>;

/// Decode one pickle from a byte slice.
pub fn from_slice(data: &[u8]) -> Result<Value> {
    Unpickler::new(SliceSource::new(data)).load()
}

/// Decode one pickle from a buffered reader.
pub fn from_reader<R: BufRead>(reader: R) -> Result<Value> {
    Unpickler::new(IoSource::new(reader)).load()
}

/// Streaming pickle decoder: replays the opcode stream against an
/// operand stack and a memo.
///
/// `load` may be called repeatedly on a source holding concatenated
/// pickles; the memo carries over, so later pickles resolve
/// back-references into earlier ones (the counterpart of a
/// [`Pickler`](crate::Pickler) that ran several `dump`s).
pub struct Unpickler<S> {
    source: S,
    stack: Vec<Value>,
    /// Stack segments saved by MARK; the live segment is `stack`.
    metastack: Vec<Vec<Value>>,
    memo: Vec<Option<Value>>,
    model: Box<dyn ObjectModel>,
    extensions: ExtensionRegistry,
    persistent_load: Option<PersistentLoadFn>,
}

impl<S: ByteSource> Unpickler<S> {
    pub fn new(source: S) -> Unpickler<S> {
        Unpickler {
            source,
            stack: Vec::with_capacity(16),
            metastack: Vec::with_capacity(4),
            memo: Vec::with_capacity(16),
            model: Box::new(SymbolicModel),
            extensions: ExtensionRegistry::new(),
            persistent_load: None,
        }
    }

    /// Replace the symbolic object model with a host implementation.
    pub fn with_model(mut self, model: impl ObjectModel + 'static) -> Unpickler<S> {
        self.model = Box::new(model);
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Unpickler<S> {
        self.extensions = extensions;
        self
    }

    /// Hook that resolves persistent id tokens back into values.
    pub fn with_persistent_load(
        mut self,
        hook: impl Fn(Value) -> Result<Value> + 'static,
    ) -> Unpickler<S> {
        self.persistent_load = Some(Box::new(hook));
        self
    }

    /// Decoded memo entries in index order, skipping unset slots.
    pub fn memo(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.memo
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|value| (idx as u32, value)))
    }

    pub fn clear_memo(&mut self) {
        self.memo.clear();
    }

    /// Read opcodes until STOP and return the reconstructed value.
    pub fn load(&mut self) -> Result<Value> {
        self.stack.clear();
        self.metastack.clear();

        loop {
            let opcode = self.source.read_u8()?;
            match opcode {
                STOP => return self.pop_value(),
                PROTO => {
                    let version = self.source.read_u8()?;
                    if version > HIGHEST_PROTOCOL {
                        return Err(Error::UnsupportedProtocol(version));
                    }
                }

                // -- None, Bool --
                NONE => self.stack.push(Value::None),
                NEWTRUE => self.stack.push(Value::Bool(true)),
                NEWFALSE => self.stack.push(Value::Bool(false)),

                // -- Integers --
                BININT => {
                    let val = self.source.read_i32_le()?;
                    self.stack.push(Value::Int(val as i64));
                }
                BININT1 => {
                    let val = self.source.read_u8()?;
                    self.stack.push(Value::Int(val as i64));
                }
                BININT2 => {
                    let val = self.source.read_u16_le()?;
                    self.stack.push(Value::Int(val as i64));
                }
                INT => {
                    let line = self.read_line_str()?;
                    let text = line.trim();
                    // INT doubles as the protocol-0 boolean encoding
                    if text == "00" {
                        self.stack.push(Value::Bool(false));
                    } else if text == "01" {
                        self.stack.push(Value::Bool(true));
                    } else {
                        let val: i64 = text
                            .parse()
                            .map_err(|e| Error::Unpickling(format!("INT parse: {e}")))?;
                        self.stack.push(Value::Int(val));
                    }
                }
                LONG => {
                    let line = self.read_line_str()?;
                    let text = line.trim().trim_end_matches('L');
                    if text.len() > MAX_LONG_DIGITS {
                        return Err(Error::OutOfRange("LONG has too many digits".into()));
                    }
                    let val: BigInt = text
                        .parse()
                        .map_err(|e| Error::Unpickling(format!("LONG parse: {e}")))?;
                    self.stack.push(Value::from_bigint(val));
                }
                LONG1 => {
                    let n = self.source.read_u8()? as usize;
                    if n == 4 {
                        // common case pickled as a plain signed int
                        let val = self.source.read_i32_le()?;
                        self.stack.push(Value::Int(val as i64));
                    } else {
                        let bytes = self.source.read_vec(n)?;
                        self.stack
                            .push(Value::from_bigint(BigInt::from_signed_bytes_le(&bytes)));
                    }
                }
                LONG4 => {
                    let n = self.source.read_i32_le()?;
                    if n < 0 {
                        return Err(Error::OutOfRange("negative length in LONG4".into()));
                    }
                    let bytes = self.source.read_vec(n as usize)?;
                    self.stack
                        .push(Value::from_bigint(BigInt::from_signed_bytes_le(&bytes)));
                }

                // -- Floats --
                BINFLOAT => {
                    let val = self.source.read_f64_be()?;
                    self.stack.push(Value::Float(val));
                }
                FLOAT => {
                    let line = self.read_line_str()?;
                    let val: f64 = line
                        .trim()
                        .parse()
                        .map_err(|e| Error::Unpickling(format!("FLOAT parse: {e}")))?;
                    self.stack.push(Value::Float(val));
                }

                // -- 8-bit strings --
                BINSTRING => {
                    let n = self.source.read_i32_le()?;
                    if n < 0 {
                        return Err(Error::OutOfRange("negative length in BINSTRING".into()));
                    }
                    let bytes = self.source.read_vec(n as usize)?;
                    self.stack.push(Value::Bytes(bytes.into()));
                }
                SHORT_BINSTRING => {
                    let n = self.source.read_u8()? as usize;
                    let bytes = self.source.read_vec(n)?;
                    self.stack.push(Value::Bytes(bytes.into()));
                }
                STRING => {
                    let line = self.source.read_line()?;
                    let inner = strip_quotes(&line)?;
                    let bytes = decode_string_escape(inner)?;
                    self.stack.push(Value::Bytes(bytes.into()));
                }

                // -- Text strings --
                BINUNICODE => {
                    let n = self.source.read_u32_le()? as usize;
                    let bytes = self.source.read_vec(n)?;
                    let text = String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?;
                    self.stack.push(Value::String(text.into()));
                }
                UNICODE => {
                    let line = self.source.read_line()?;
                    let text = decode_raw_unicode_escape(&line)?;
                    self.stack.push(Value::String(text.into()));
                }

                // -- Mark handling --
                MARK => {
                    let segment = mem::take(&mut self.stack);
                    self.metastack.push(segment);
                }
                POP_MARK => {
                    self.pop_mark()?;
                }
                POP => {
                    if self.stack.is_empty() {
                        // popping with an empty segment consumes the mark
                        self.pop_mark()?;
                    } else {
                        self.stack.pop();
                    }
                }
                DUP => {
                    let top = self.peek_value()?.clone();
                    self.stack.push(top);
                }

                // -- Tuples --
                EMPTY_TUPLE => self.stack.push(Value::tuple(Vec::new())),
                TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::tuple(items));
                }
                TUPLE1 => {
                    let a = self.pop_value()?;
                    self.stack.push(Value::tuple(vec![a]));
                }
                TUPLE2 => {
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    self.stack.push(Value::tuple(vec![a, b]));
                }
                TUPLE3 => {
                    let c = self.pop_value()?;
                    let b = self.pop_value()?;
                    let a = self.pop_value()?;
                    self.stack.push(Value::tuple(vec![a, b, c]));
                }

                // -- Lists --
                EMPTY_LIST => self.stack.push(Value::list(Vec::new())),
                LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::list(items));
                }
                APPEND => {
                    let item = self.pop_value()?;
                    self.append_items(vec![item])?;
                }
                APPENDS => {
                    let items = self.pop_mark()?;
                    self.append_items(items)?;
                }

                // -- Dicts --
                EMPTY_DICT => self.stack.push(Value::dict(Vec::new())),
                DICT => {
                    let items = self.pop_mark()?;
                    let pairs = items_to_pairs(items)?;
                    self.stack.push(Value::dict(pairs));
                }
                SETITEM => {
                    let val = self.pop_value()?;
                    let key = self.pop_value()?;
                    self.set_items(vec![(key, val)])?;
                }
                SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = items_to_pairs(items)?;
                    self.set_items(pairs)?;
                }

                // -- Memo --
                GET => {
                    let line = self.read_line_str()?;
                    let idx: usize = line
                        .trim()
                        .parse()
                        .map_err(|e| Error::Unpickling(format!("GET index: {e}")))?;
                    let val = self.memo_get(idx)?;
                    self.stack.push(val);
                }
                BINGET => {
                    let idx = self.source.read_u8()? as usize;
                    let val = self.memo_get(idx)?;
                    self.stack.push(val);
                }
                LONG_BINGET => {
                    let idx = self.source.read_u32_le()? as usize;
                    let val = self.memo_get(idx)?;
                    self.stack.push(val);
                }
                PUT => {
                    let line = self.read_line_str()?;
                    let idx: usize = line
                        .trim()
                        .parse()
                        .map_err(|e| Error::Unpickling(format!("PUT index: {e}")))?;
                    let val = self.peek_value()?.clone();
                    self.memo_put(idx, val)?;
                }
                BINPUT => {
                    let idx = self.source.read_u8()? as usize;
                    let val = self.peek_value()?.clone();
                    self.memo_put(idx, val)?;
                }
                LONG_BINPUT => {
                    let idx = self.source.read_u32_le()? as usize;
                    let val = self.peek_value()?.clone();
                    self.memo_put(idx, val)?;
                }

                // -- Globals and instances --
                GLOBAL => {
                    let module = self.read_line_str()?;
                    let name = self.read_line_str()?;
                    let global = self.model.find_global(&module, &name)?;
                    self.stack.push(global);
                }
                EXT1 => {
                    let code = self.source.read_u8()? as i32;
                    self.push_extension(code)?;
                }
                EXT2 => {
                    let code = self.source.read_u16_le()? as i32;
                    self.push_extension(code)?;
                }
                EXT4 => {
                    let code = self.source.read_i32_le()?;
                    self.push_extension(code)?;
                }
                REDUCE => {
                    let args = self.pop_value()?;
                    let callable = self.pop_value()?;
                    let args = match args {
                        Value::Tuple(_) => args,
                        // a None argument list means "bare construction"
                        Value::None => Value::tuple(Vec::new()),
                        other => {
                            return Err(Error::Unpickling(format!(
                                "REDUCE expected an argument tuple, got {other}"
                            )))
                        }
                    };
                    let result = self.model.call(callable, args)?;
                    self.stack.push(result);
                }
                NEWOBJ => {
                    let args = self.pop_value()?;
                    if !matches!(args, Value::Tuple(_)) {
                        return Err(Error::Unpickling(format!(
                            "NEWOBJ expected an argument tuple, got {args}"
                        )));
                    }
                    let class = self.pop_value()?;
                    let result = self.model.new_object(class, args)?;
                    self.stack.push(result);
                }
                INST => {
                    let module = self.read_line_str()?;
                    let name = self.read_line_str()?;
                    let args = self.pop_mark()?;
                    let class = self.model.find_global(&module, &name)?;
                    let result = self.model.call(class, Value::tuple(args))?;
                    self.stack.push(result);
                }
                OBJ => {
                    let mut items = self.pop_mark()?;
                    if items.is_empty() {
                        return Err(Error::Unpickling(
                            "no class on the stack for OBJ".into(),
                        ));
                    }
                    let class = items.remove(0);
                    let result = self.model.call(class, Value::tuple(items))?;
                    self.stack.push(result);
                }
                BUILD => {
                    let state = self.pop_value()?;
                    // the target stays on the stack; state is applied to
                    // the shared node, so memo copies observe it too
                    let target = self.peek_value()?.clone();
                    self.model.set_state(&target, state)?;
                }

                // -- Persistent ids --
                PERSID => {
                    let pid = self.read_line_str()?;
                    let value = self.call_persistent_load(Value::string(pid))?;
                    self.stack.push(value);
                }
                BINPERSID => {
                    let pid = self.pop_value()?;
                    let value = self.call_persistent_load(pid)?;
                    self.stack.push(value);
                }

                _ => return Err(Error::UnknownOpcode(opcode)),
            }
        }
    }

    // -- Stack operations --

    fn pop_value(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(Error::StackUnderflow)
    }

    fn peek_value(&self) -> Result<&Value> {
        self.stack.last().ok_or(Error::StackUnderflow)
    }

    /// Take everything pushed since the nearest MARK, restoring the
    /// segment beneath it.
    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let previous = self
            .metastack
            .pop()
            .ok_or_else(|| Error::Unpickling("mark not found".into()))?;
        Ok(mem::replace(&mut self.stack, previous))
    }

    fn append_items(&mut self, items: Vec<Value>) -> Result<()> {
        match self.peek_value()? {
            Value::List(list) => {
                list.borrow_mut().extend(items);
                Ok(())
            }
            Value::Object(obj) => {
                obj.list_items.borrow_mut().extend(items);
                Ok(())
            }
            other => Err(Error::Unpickling(format!("APPEND on non-list value {other}"))),
        }
    }

    fn set_items(&mut self, pairs: Vec<(Value, Value)>) -> Result<()> {
        match self.peek_value()? {
            Value::Dict(dict) => {
                dict.borrow_mut().extend(pairs);
                Ok(())
            }
            Value::Object(obj) => {
                obj.dict_items.borrow_mut().extend(pairs);
                Ok(())
            }
            other => Err(Error::Unpickling(format!("SETITEM on non-dict value {other}"))),
        }
    }

    // -- Memo operations --

    fn memo_put(&mut self, idx: usize, val: Value) -> Result<()> {
        if idx >= MAX_MEMO_SIZE {
            return Err(Error::OutOfRange(format!(
                "memo index {idx} exceeds maximum {MAX_MEMO_SIZE}"
            )));
        }
        if idx >= self.memo.len() {
            self.memo.resize(idx + 1, None);
        }
        self.memo[idx] = Some(val);
        Ok(())
    }

    fn memo_get(&self, idx: usize) -> Result<Value> {
        self.memo
            .get(idx)
            .and_then(|slot| slot.clone())
            .ok_or(Error::BadPickleGet(idx as u32))
    }

    // -- Hooks --

    fn push_extension(&mut self, code: i32) -> Result<()> {
        let (module, name) = match self.extensions.resolve(code) {
            Some(global) => (global.module.clone(), global.name.clone()),
            None => {
                return Err(Error::Unpickling(format!(
                    "unregistered extension code {code}"
                )))
            }
        };
        let value = self.model.find_global(&module, &name)?;
        self.stack.push(value);
        Ok(())
    }

    fn call_persistent_load(&self, pid: Value) -> Result<Value> {
        match &self.persistent_load {
            Some(hook) => hook(pid),
            None => Err(Error::Unpickling(
                "persistent id in stream but no persistent_load hook is set".into(),
            )),
        }
    }

    fn read_line_str(&mut self) -> Result<String> {
        let line = self.source.read_line()?;
        String::from_utf8(line).map_err(|_| Error::InvalidUtf8)
    }
}

/// Convert a flat `[k1, v1, k2, v2, ...]` mark slice into pairs.
fn items_to_pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    if items.len() % 2 != 0 {
        return Err(Error::Unpickling("odd number of items for dict".into()));
    }
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    Ok(pairs)
}

fn strip_quotes(line: &[u8]) -> Result<&[u8]> {
    if line.len() >= 2 {
        let (first, last) = (line[0], line[line.len() - 1]);
        if first == last && (first == b'\'' || first == b'"') {
            return Ok(&line[1..line.len() - 1]);
        }
    }
    Err(Error::Unpickling(
        "the STRING opcode argument must be quoted".into(),
    ))
}

/// Python-repr style escapes for the protocol-0 STRING payload.
fn decode_string_escape(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        i += 1;
        let esc = *bytes
            .get(i)
            .ok_or_else(|| Error::Unpickling("truncated escape in STRING".into()))?;
        i += 1;
        match esc {
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'x' => {
                let hex = bytes
                    .get(i..i + 2)
                    .ok_or_else(|| Error::Unpickling("truncated \\x escape in STRING".into()))?;
                let hex = std::str::from_utf8(hex).map_err(|_| Error::InvalidUtf8)?;
                let val = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::Unpickling("invalid \\x escape in STRING".into()))?;
                out.push(val);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut val = (esc - b'0') as u32;
                let mut digits = 1;
                while digits < 3 {
                    match bytes.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            val = val * 8 + (d - b'0') as u32;
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                out.push((val & 0xff) as u8);
            }
            other => {
                // unrecognized escapes pass through verbatim
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}

/// Latin-1 passthrough with `\uXXXX` / `\UXXXXXXXX` escapes; UTF-16
/// surrogate pairs written by other producers are recombined.
fn decode_raw_unicode_escape(bytes: &[u8]) -> Result<String> {
    fn hex_code(bytes: &[u8], at: usize, digits: usize) -> Result<u32> {
        let hex = bytes
            .get(at..at + digits)
            .ok_or_else(|| Error::Unpickling("truncated unicode escape".into()))?;
        let hex = std::str::from_utf8(hex).map_err(|_| Error::InvalidUtf8)?;
        u32::from_str_radix(hex, 16)
            .map_err(|_| Error::Unpickling("invalid unicode escape".into()))
    }

    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes[i] == b'\\'
            && matches!(bytes.get(i + 1), Some(&b'u') | Some(&b'U'));
        if !escape {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        let digits = if bytes[i + 1] == b'U' { 8 } else { 4 };
        let mut code = hex_code(bytes, i + 2, digits)?;
        i += 2 + digits;
        if (0xd800..0xdc00).contains(&code)
            && bytes.get(i) == Some(&b'\\')
            && bytes.get(i + 1) == Some(&b'u')
        {
            let low = hex_code(bytes, i + 2, 4)?;
            if (0xdc00..0xe000).contains(&low) {
                code = 0x10000 + ((code - 0xd800) << 10) + (low - 0xdc00);
                i += 6;
            }
        }
        let ch = char::from_u32(code)
            .ok_or_else(|| Error::Unpickling(format!("invalid unicode escape \\u{code:04x}")))?;
        out.push(ch);
    }
    Ok(out)
}
