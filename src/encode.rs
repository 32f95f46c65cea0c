use std::io::Write;

use num_bigint::BigInt;

use crate::error::{Error, Result};
use crate::memo::MemoTable;
use crate::object::{ExtensionRegistry, Reduction};
use crate::opcodes::*;
use crate::value::{ConstructKind, Global, Object, Value};
use crate::HIGHEST_PROTOCOL;

type PersistentIdFn = Box<dyn Fn(&Value) -> Option<String>>;
type ReducerFn = Box<dyn Fn(&Object) -> Option<Reduction>>;

/// Encode a value graph as a pickle at the given protocol.
pub fn to_vec(value: &Value, protocol: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(256);
    to_writer(&mut buf, value, protocol)?;
    Ok(buf)
}

/// Encode a value graph into any writer.
pub fn to_writer<W: Write>(writer: W, value: &Value, protocol: u8) -> Result<()> {
    Pickler::new(writer, protocol)?.dump(value)
}

/// Streaming pickle encoder.
///
/// A `Pickler` may `dump` several values in a row; the memo is shared
/// across those pickles, so later streams back-reference objects from
/// earlier ones (decode them with one [`Unpickler`](crate::Unpickler)
/// and repeated `load` calls). Call [`clear_memo`](Pickler::clear_memo)
/// to sever that.
pub struct Pickler<W> {
    writer: W,
    protocol: u8,
    batch_size: usize,
    memo: MemoTable,
    extensions: ExtensionRegistry,
    persistent_id: Option<PersistentIdFn>,
    reducer: Option<ReducerFn>,
}

impl<W: Write> Pickler<W> {
    /// Create a pickler for `protocol` (0, 1 or 2).
    pub fn new(writer: W, protocol: u8) -> Result<Pickler<W>> {
        if protocol > HIGHEST_PROTOCOL {
            return Err(Error::UnsupportedProtocol(protocol));
        }
        Ok(Pickler {
            writer,
            protocol,
            batch_size: 1000,
            memo: MemoTable::new(),
            extensions: ExtensionRegistry::new(),
            persistent_id: None,
            reducer: None,
        })
    }

    /// Elements per MARK..APPENDS/SETITEMS group (default 1000).
    pub fn with_batch_size(mut self, batch_size: usize) -> Pickler<W> {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Hook that replaces a value with a persistent id token. A `Some`
    /// return pickles the token instead of the value's content.
    pub fn with_persistent_id(mut self, hook: impl Fn(&Value) -> Option<String> + 'static) -> Pickler<W> {
        self.persistent_id = Some(Box::new(hook));
        self
    }

    /// Hook consulted before an instance's own reduction.
    pub fn with_reducer(mut self, hook: impl Fn(&Object) -> Option<Reduction> + 'static) -> Pickler<W> {
        self.reducer = Some(Box::new(hook));
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionRegistry) -> Pickler<W> {
        self.extensions = extensions;
        self
    }

    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    pub fn memo(&self) -> &MemoTable {
        &self.memo
    }

    pub fn clear_memo(&mut self) {
        self.memo.clear();
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Pickle one value: optional PROTO header, the value, STOP.
    pub fn dump(&mut self, value: &Value) -> Result<()> {
        if self.protocol >= 2 {
            self.write_all(&[PROTO, self.protocol])?;
        }
        self.save(value)?;
        self.write_opcode(STOP)
    }

    // -- Dispatch --

    fn save(&mut self, value: &Value) -> Result<()> {
        if let Some(pid) = self.persistent_id.as_ref().and_then(|hook| hook(value)) {
            return self.save_persistent_id(&pid);
        }

        // Anything with identity short-circuits to a back-reference;
        // scalars have none and re-encode every time.
        if value.identity().is_some() {
            if let Some(id) = self.memo.get(value) {
                return self.write_get(id);
            }
        }

        match value {
            Value::None => self.write_opcode(NONE),
            Value::Bool(b) => self.save_bool(*b),
            Value::Int(i) => self.save_int(*i),
            Value::BigInt(bi) => self.save_long(bi.clone()),
            Value::Float(x) => self.save_float(*x),
            Value::String(s) => self.save_string(value, s),
            Value::Bytes(b) => self.save_bytes(value, b),
            Value::Tuple(items) => self.save_tuple(value, items),
            Value::List(items) => {
                let snapshot = items.borrow();
                self.save_list(value, &snapshot)
            }
            Value::Dict(pairs) => {
                let snapshot = pairs.borrow();
                self.save_dict(value, &snapshot)
            }
            Value::Global(global) => self.save_global(value, global),
            Value::Object(object) => {
                let reduction = self
                    .reducer
                    .as_ref()
                    .and_then(|hook| hook(object))
                    .unwrap_or_else(|| object.reduction());
                self.save_reduce(value, reduction)
            }
        }
    }

    // -- Scalars --

    fn save_bool(&mut self, value: bool) -> Result<()> {
        if self.protocol >= 2 {
            self.write_opcode(if value { NEWTRUE } else { NEWFALSE })
        } else {
            self.write_opcode(INT)?;
            self.write_line(if value { "01" } else { "00" })
        }
    }

    fn save_int(&mut self, value: i64) -> Result<()> {
        if self.protocol < 1 {
            if i32::try_from(value).is_ok() {
                self.write_opcode(INT)?;
                self.write_line(&value.to_string())
            } else {
                self.write_opcode(LONG)?;
                self.write_line(&value.to_string())
            }
        } else if (0..256).contains(&value) {
            self.write_all(&[BININT1, value as u8])
        } else if (0..65536).contains(&value) {
            self.write_opcode(BININT2)?;
            self.write_all(&(value as u16).to_le_bytes())
        } else if let Ok(v) = i32::try_from(value) {
            self.write_opcode(BININT)?;
            self.write_all(&v.to_le_bytes())
        } else {
            self.save_long(BigInt::from(value))
        }
    }

    fn save_long(&mut self, value: BigInt) -> Result<()> {
        if self.protocol < 2 {
            self.write_opcode(LONG)?;
            return self.write_line(&value.to_string());
        }
        if value == BigInt::from(0) {
            // zero pickles as a zero-length payload
            return self.write_all(&[LONG1, 0]);
        }
        if let Ok(small) = i32::try_from(&value) {
            if let Ok(v) = i8::try_from(small) {
                return self.write_all(&[LONG1, 1, v as u8]);
            }
            if let Ok(v) = i16::try_from(small) {
                self.write_all(&[LONG1, 2])?;
                return self.write_all(&v.to_le_bytes());
            }
            self.write_all(&[LONG1, 4])?;
            return self.write_all(&small.to_le_bytes());
        }
        let bytes = value.to_signed_bytes_le();
        if bytes.len() < 256 {
            self.write_all(&[LONG1, bytes.len() as u8])?;
        } else {
            let len = i32::try_from(bytes.len())
                .map_err(|_| Error::OutOfRange("long payload exceeds 4-byte length".into()))?;
            self.write_opcode(LONG4)?;
            self.write_all(&len.to_le_bytes())?;
        }
        self.write_all(&bytes)
    }

    fn save_float(&mut self, value: f64) -> Result<()> {
        if self.protocol < 1 {
            self.write_opcode(FLOAT)?;
            let mut buf = ryu::Buffer::new();
            self.write_line(buf.format(value))
        } else {
            self.write_opcode(BINFLOAT)?;
            self.write_all(&value.to_be_bytes())
        }
    }

    // -- Strings --

    fn save_string(&mut self, value: &Value, text: &str) -> Result<()> {
        let id = self.memoize(value)?;
        if self.protocol < 1 {
            self.write_opcode(UNICODE)?;
            let escaped = raw_unicode_escape(text);
            self.write_all(&escaped)?;
            self.write_all(b"\n")?;
        } else {
            let len = u32::try_from(text.len())
                .map_err(|_| Error::OutOfRange("string exceeds 4-byte length".into()))?;
            self.write_opcode(BINUNICODE)?;
            self.write_all(&len.to_le_bytes())?;
            self.write_all(text.as_bytes())?;
        }
        self.write_put(id)
    }

    fn save_bytes(&mut self, value: &Value, data: &[u8]) -> Result<()> {
        let id = self.memoize(value)?;
        if self.protocol < 1 {
            self.write_opcode(STRING)?;
            let escaped = repr_bytes(data);
            self.write_all(&escaped)?;
            self.write_all(b"\n")?;
        } else if data.len() < 256 {
            self.write_all(&[SHORT_BINSTRING, data.len() as u8])?;
            self.write_all(data)?;
        } else {
            let len = i32::try_from(data.len())
                .map_err(|_| Error::OutOfRange("string exceeds 4-byte length".into()))?;
            self.write_opcode(BINSTRING)?;
            self.write_all(&len.to_le_bytes())?;
            self.write_all(data)?;
        }
        self.write_put(id)
    }

    // -- Containers --

    fn save_tuple(&mut self, value: &Value, items: &[Value]) -> Result<()> {
        let len = items.len();
        if len == 0 {
            // stateless, never memoized
            if self.protocol >= 1 {
                return self.write_opcode(EMPTY_TUPLE);
            }
            return self.write_all(&[MARK, TUPLE]);
        }

        let short_form = self.protocol >= 2 && len <= 3;
        if !short_form {
            self.write_opcode(MARK)?;
        }
        for item in items {
            self.save(item)?;
        }

        if let Some(id) = self.memo.get(value) {
            // The tuple pickled itself while its items were being saved:
            // discard the partial build and reuse the memoized copy.
            if short_form {
                for _ in 0..len {
                    self.write_opcode(POP)?;
                }
            } else if self.protocol >= 1 {
                self.write_opcode(POP_MARK)?;
            } else {
                for _ in 0..=len {
                    self.write_opcode(POP)?;
                }
            }
            return self.write_get(id);
        }

        let opcode = match len {
            1 if short_form => TUPLE1,
            2 if short_form => TUPLE2,
            3 if short_form => TUPLE3,
            _ => TUPLE,
        };
        self.write_opcode(opcode)?;
        let id = self.memoize(value)?;
        self.write_put(id)
    }

    fn save_list(&mut self, value: &Value, items: &[Value]) -> Result<()> {
        let id = self.memoize(value)?;
        if self.protocol < 1 {
            self.write_all(&[MARK, LIST])?;
        } else {
            self.write_opcode(EMPTY_LIST)?;
        }
        self.write_put(id)?;
        self.batch_appends(items)
    }

    fn save_dict(&mut self, value: &Value, pairs: &[(Value, Value)]) -> Result<()> {
        let id = self.memoize(value)?;
        if self.protocol < 1 {
            self.write_all(&[MARK, DICT])?;
        } else {
            self.write_opcode(EMPTY_DICT)?;
        }
        self.write_put(id)?;
        self.batch_set_items(pairs)
    }

    /// Append `items` to the sequence on top of the decoder's stack,
    /// at most `batch_size` per MARK..APPENDS group, with a one-item
    /// lookahead so a trailing singleton uses plain APPEND.
    fn batch_appends(&mut self, items: &[Value]) -> Result<()> {
        if self.protocol < 1 {
            for item in items {
                self.save(item)?;
                self.write_opcode(APPEND)?;
            }
            return Ok(());
        }

        let mut iter = items.iter();
        let Some(mut next) = iter.next() else {
            return Ok(());
        };
        let mut batched = 0usize;
        for upcoming in iter {
            let current = next;
            next = upcoming;
            if batched == self.batch_size {
                self.write_opcode(APPENDS)?;
                batched = 0;
            }
            if batched == 0 {
                self.write_opcode(MARK)?;
            }
            self.save(current)?;
            batched += 1;
        }
        if batched == self.batch_size {
            self.write_opcode(APPENDS)?;
            batched = 0;
        }
        self.save(next)?;
        batched += 1;
        self.write_opcode(if batched > 1 { APPENDS } else { APPEND })
    }

    /// SETITEM/SETITEMS twin of [`batch_appends`](Pickler::batch_appends).
    fn batch_set_items(&mut self, pairs: &[(Value, Value)]) -> Result<()> {
        if self.protocol < 1 {
            for (key, val) in pairs {
                self.save(key)?;
                self.save(val)?;
                self.write_opcode(SETITEM)?;
            }
            return Ok(());
        }

        let mut iter = pairs.iter();
        let Some(mut next) = iter.next() else {
            return Ok(());
        };
        let mut batched = 0usize;
        for upcoming in iter {
            let current = next;
            next = upcoming;
            if batched == self.batch_size {
                self.write_opcode(SETITEMS)?;
                batched = 0;
            }
            if batched == 0 {
                self.write_opcode(MARK)?;
            }
            self.save(&current.0)?;
            self.save(&current.1)?;
            batched += 1;
        }
        if batched == self.batch_size {
            self.write_opcode(SETITEMS)?;
            batched = 0;
        }
        self.save(&next.0)?;
        self.save(&next.1)?;
        batched += 1;
        self.write_opcode(if batched > 1 { SETITEMS } else { SETITEM })
    }

    // -- Globals and instances --

    fn save_global(&mut self, value: &Value, global: &Global) -> Result<()> {
        if self.protocol >= 2 {
            if let Some(code) = self.extensions.code_for(global) {
                return self.write_ext(code);
            }
        }
        if global.module.contains('\n') || global.name.contains('\n') {
            return Err(Error::Pickling(format!(
                "{value}: global names cannot contain newlines"
            )));
        }
        let id = self.memoize(value)?;
        self.write_opcode(GLOBAL)?;
        self.write_line(&global.module)?;
        self.write_line(&global.name)?;
        self.write_put(id)
    }

    fn save_reduce(&mut self, value: &Value, reduction: Reduction) -> Result<()> {
        if !matches!(reduction.callable, Value::Global(_) | Value::Object(_)) {
            return Err(Error::Pickling(format!(
                "{value}: reduce callable {} is not callable",
                reduction.callable
            )));
        }
        if !matches!(reduction.args, Value::Tuple(_)) {
            return Err(Error::Pickling(format!(
                "{value}: args from reduce of {} must be a tuple",
                reduction.callable
            )));
        }

        // id assigned on first sight, before the parts are written
        let id = self.memoize(value)?;
        self.save(&reduction.callable)?;
        self.save(&reduction.args)?;
        if reduction.kind == ConstructKind::New && self.protocol >= 2 {
            self.write_opcode(NEWOBJ)?;
        } else {
            self.write_opcode(REDUCE)?;
        }
        self.write_put(id)?;

        if let Some(state) = &reduction.state {
            self.save(state)?;
            self.write_opcode(BUILD)?;
        }
        if !reduction.list_items.is_empty() {
            self.batch_appends(&reduction.list_items)?;
        }
        if !reduction.dict_items.is_empty() {
            self.batch_set_items(&reduction.dict_items)?;
        }
        Ok(())
    }

    fn save_persistent_id(&mut self, pid: &str) -> Result<()> {
        if self.protocol >= 1 {
            self.save(&Value::string(pid))?;
            self.write_opcode(BINPERSID)
        } else {
            if pid.contains('\n') {
                return Err(Error::Pickling(format!(
                    "persistent id {pid:?} cannot contain newlines"
                )));
            }
            self.write_opcode(PERSID)?;
            self.write_line(pid)
        }
    }

    // -- Memo emission --

    fn memoize(&mut self, value: &Value) -> Result<u32> {
        self.memo
            .memoize(value)
            .ok_or_else(|| Error::Pickling(format!("{value}: scalar values have no identity")))
    }

    fn write_get(&mut self, id: u32) -> Result<()> {
        if self.protocol < 1 {
            self.write_opcode(GET)?;
            self.write_line(&id.to_string())
        } else if id < 256 {
            self.write_all(&[BINGET, id as u8])
        } else {
            self.write_opcode(LONG_BINGET)?;
            self.write_all(&id.to_le_bytes())
        }
    }

    fn write_put(&mut self, id: u32) -> Result<()> {
        if self.protocol < 1 {
            self.write_opcode(PUT)?;
            self.write_line(&id.to_string())
        } else if id < 256 {
            self.write_all(&[BINPUT, id as u8])
        } else {
            self.write_opcode(LONG_BINPUT)?;
            self.write_all(&id.to_le_bytes())
        }
    }

    fn write_ext(&mut self, code: i32) -> Result<()> {
        if let Ok(small) = u8::try_from(code) {
            self.write_all(&[EXT1, small])
        } else if let Ok(medium) = u16::try_from(code) {
            self.write_opcode(EXT2)?;
            self.write_all(&medium.to_le_bytes())
        } else {
            self.write_opcode(EXT4)?;
            self.write_all(&code.to_le_bytes())
        }
    }

    // -- Raw output --

    fn write_opcode(&mut self, opcode: u8) -> Result<()> {
        self.write_all(&[opcode])
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        Ok(())
    }

    fn write_line(&mut self, text: &str) -> Result<()> {
        self.write_all(text.as_bytes())?;
        self.write_all(b"\n")
    }
}

/// Protocol-0 UNICODE payload: latin-1 passthrough with `\uXXXX` /
/// `\UXXXXXXXX` escapes, plus escaped backslash and newline so the
/// payload stays a single line.
fn raw_unicode_escape(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.extend_from_slice(b"\\u005c"),
            '\n' => out.extend_from_slice(b"\\u000a"),
            c if (c as u32) < 0x100 => out.push(c as u32 as u8),
            c if (c as u32) <= 0xffff => {
                out.extend(format!("\\u{:04x}", c as u32).into_bytes())
            }
            c => out.extend(format!("\\U{:08x}", c as u32).into_bytes()),
        }
    }
    out
}

/// Protocol-0 STRING payload: single-quoted, python-repr-style escapes.
fn repr_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    out.push(b'\'');
    for &b in data {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\'' => out.extend_from_slice(b"\\'"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x20..=0x7e => out.push(b),
            _ => out.extend(format!("\\x{b:02x}").into_bytes()),
        }
    }
    out.push(b'\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{from_slice, Unpickler};
    use crate::read::SliceSource;

    fn round_trip(value: &Value, protocol: u8) -> Value {
        let bytes = to_vec(value, protocol).unwrap();
        from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_encode_none() {
        assert_eq!(to_vec(&Value::None, 2).unwrap(), b"\x80\x02N.");
        assert_eq!(to_vec(&Value::None, 0).unwrap(), b"N.");
    }

    #[test]
    fn test_encode_small_int() {
        assert_eq!(to_vec(&Value::Int(42), 2).unwrap(), b"\x80\x02K\x2a.");
    }

    #[test]
    fn test_int_width_selection() {
        // one byte
        assert_eq!(to_vec(&Value::Int(255), 1).unwrap(), b"K\xff.");
        // two bytes, little-endian
        assert_eq!(to_vec(&Value::Int(256), 1).unwrap(), b"M\x00\x01.");
        assert_eq!(to_vec(&Value::Int(65535), 1).unwrap(), b"M\xff\xff.");
        // four bytes, signed
        assert_eq!(to_vec(&Value::Int(65536), 1).unwrap(), b"J\x00\x00\x01\x00.");
        assert_eq!(to_vec(&Value::Int(-1), 1).unwrap(), b"J\xff\xff\xff\xff.");
    }

    #[test]
    fn test_encode_bool_by_protocol() {
        assert_eq!(to_vec(&Value::Bool(true), 2).unwrap(), b"\x80\x02\x88.");
        assert_eq!(to_vec(&Value::Bool(false), 2).unwrap(), b"\x80\x02\x89.");
        assert_eq!(to_vec(&Value::Bool(true), 0).unwrap(), b"I01\n.");
        assert_eq!(to_vec(&Value::Bool(false), 0).unwrap(), b"I00\n.");
    }

    #[test]
    fn test_encode_float_big_endian() {
        let bytes = to_vec(&Value::Float(3.14159), 2).unwrap();
        let mut expected = vec![0x80, 0x02, BINFLOAT];
        expected.extend_from_slice(&3.14159f64.to_be_bytes());
        expected.push(b'.');
        assert_eq!(bytes, expected);
        assert_eq!(round_trip(&Value::Float(3.14159), 2), Value::Float(3.14159));
    }

    #[test]
    fn test_encode_long1_minimal_widths() {
        // zero: empty payload
        assert_eq!(
            to_vec(&Value::BigInt(BigInt::from(0)), 2).unwrap(),
            b"\x80\x02\x8a\x00."
        );
        // one byte
        assert_eq!(
            to_vec(&Value::BigInt(BigInt::from(-5)), 2).unwrap(),
            b"\x80\x02\x8a\x01\xfb."
        );
        // two bytes
        assert_eq!(
            to_vec(&Value::BigInt(BigInt::from(0x1234)), 2).unwrap(),
            b"\x80\x02\x8a\x02\x34\x12."
        );
        // four bytes, read back through the length-4 fast path
        assert_eq!(
            to_vec(&Value::BigInt(BigInt::from(0x12345678)), 2).unwrap(),
            b"\x80\x02\x8a\x04\x78\x56\x34\x12."
        );
    }

    #[test]
    fn test_encode_string_binary() {
        assert_eq!(
            to_vec(&Value::string("hello"), 2).unwrap(),
            b"\x80\x02X\x05\x00\x00\x00helloq\x00."
        );
    }

    #[test]
    fn test_shared_string_emits_get() {
        let s = Value::string("aaaaa");
        let pair = Value::tuple(vec![s.clone(), s]);
        let bytes = to_vec(&pair, 2).unwrap();
        // one BINUNICODE, one BINGET back-reference
        assert_eq!(
            bytes.iter().filter(|&&b| b == BINUNICODE).count(),
            1,
            "string content must be written once: {bytes:?}"
        );
        assert!(bytes.windows(2).any(|w| w[0] == BINGET && w[1] == 0));

        let Value::Tuple(items) = from_slice(&bytes).unwrap() else {
            panic!("expected tuple");
        };
        assert!(items[0].is(&items[1]));
    }

    #[test]
    fn test_empty_tuple_not_memoized() {
        let empty = Value::tuple(vec![]);
        let pair = Value::tuple(vec![empty.clone(), empty]);
        let bytes = to_vec(&pair, 2).unwrap();
        // both occurrences re-emit EMPTY_TUPLE; no get in the stream
        assert_eq!(bytes.iter().filter(|&&b| b == EMPTY_TUPLE).count(), 2);
        assert!(!bytes.contains(&BINGET));
    }

    #[test]
    fn test_round_trip_scalars() {
        for proto in 0..=2 {
            for value in [
                Value::None,
                Value::Bool(true),
                Value::Bool(false),
                Value::Int(0),
                Value::Int(255),
                Value::Int(256),
                Value::Int(65535),
                Value::Int(65536),
                Value::Int(-1),
                Value::Int(i32::MAX as i64),
                Value::Int(i32::MIN as i64),
                Value::Int(i64::MAX),
                Value::Int(i64::MIN),
                Value::Float(0.0),
                Value::Float(-2.5),
                Value::Float(1.0e300),
                Value::from_bigint(BigInt::parse_bytes(b"123456789012345678901234567890", 10).unwrap()),
                Value::from_bigint(-BigInt::parse_bytes(b"987654321098765432109876543210", 10).unwrap()),
            ] {
                assert_eq!(round_trip(&value, proto), value, "protocol {proto}");
            }
        }
    }

    #[test]
    fn test_round_trip_huge_long4() {
        // payload of 256+ bytes forces LONG4
        let huge = BigInt::from(7) << 2500;
        let value = Value::BigInt(huge);
        let bytes = to_vec(&value, 2).unwrap();
        assert!(bytes.contains(&LONG4));
        assert_eq!(from_slice(&bytes).unwrap(), value);
    }

    #[test]
    fn test_round_trip_strings() {
        for proto in 0..=2 {
            for text in ["", "hello", "naïve", "日本語", "line\nbreak\\and\ttab", "🦀"] {
                let value = Value::string(text);
                assert_eq!(round_trip(&value, proto), value, "protocol {proto}, {text:?}");
            }
        }
    }

    #[test]
    fn test_round_trip_bytes() {
        for proto in 0..=2 {
            let value = Value::bytes(vec![0u8, 1, 2, 0xff, b'\'', b'\\', b'\n']);
            assert_eq!(round_trip(&value, proto), value, "protocol {proto}");
        }
        let long = Value::bytes(vec![0xabu8; 300]);
        assert_eq!(round_trip(&long, 2), long);
    }

    #[test]
    fn test_round_trip_containers() {
        for proto in 0..=2 {
            let value = Value::dict(vec![
                (
                    Value::string("items"),
                    Value::list(vec![
                        Value::tuple(vec![Value::Int(1), Value::Int(2)]),
                        Value::dict(vec![]),
                        Value::None,
                    ]),
                ),
                (Value::Int(7), Value::string("seven")),
            ]);
            assert_eq!(round_trip(&value, proto), value, "protocol {proto}");
        }
    }

    #[test]
    fn test_round_trip_tuple_sizes() {
        for proto in 0..=2 {
            for n in 0..6 {
                let value = Value::tuple((0..n).map(Value::Int).collect());
                assert_eq!(round_trip(&value, proto), value, "protocol {proto}, len {n}");
            }
        }
    }

    #[test]
    fn test_list_decodes_as_list_not_tuple() {
        let value = Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let decoded = round_trip(&value, 2);
        assert!(matches!(decoded, Value::List(_)));
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_batching_is_invisible_to_decoding() {
        let items: Vec<Value> = (0..2500).map(Value::Int).collect();
        let value = Value::list(items);
        for batch_size in [1, 2, 999, 1000, 2500] {
            let mut buf = Vec::new();
            Pickler::new(&mut buf, 2)
                .unwrap()
                .with_batch_size(batch_size)
                .dump(&value)
                .unwrap();
            assert_eq!(from_slice(&buf).unwrap(), value, "batch size {batch_size}");
        }
    }

    #[test]
    fn test_batch_groups_bounded() {
        // None avoids payload bytes that could alias the APPENDS opcode
        let value = Value::list(vec![Value::None; 2500]);
        let bytes = to_vec(&value, 2).unwrap();
        // 2500 elements at the default batch size: three APPENDS groups
        assert_eq!(bytes.iter().filter(|&&b| b == APPENDS).count(), 3);
    }

    #[test]
    fn test_trailing_singleton_uses_append() {
        let mut buf = Vec::new();
        let value = Value::list((0..3).map(Value::Int).collect());
        Pickler::new(&mut buf, 2)
            .unwrap()
            .with_batch_size(2)
            .dump(&value)
            .unwrap();
        // two items grouped, the leftover third appended singly
        assert_eq!(buf.iter().filter(|&&b| b == APPENDS).count(), 1);
        assert_eq!(buf.iter().filter(|&&b| b == APPEND).count(), 1);
        assert_eq!(from_slice(&buf).unwrap(), value);
    }

    #[test]
    fn test_shared_sublist_identity_survives() {
        let shared = Value::list(vec![Value::Int(9)]);
        let value = Value::list(vec![shared.clone(), shared]);
        for proto in 0..=2 {
            let bytes = to_vec(&value, proto).unwrap();
            let Value::List(outer) = from_slice(&bytes).unwrap() else {
                panic!("expected list");
            };
            let outer = outer.borrow();
            assert_eq!(outer.len(), 2);
            assert!(outer[0].is(&outer[1]), "protocol {proto}");
        }
    }

    #[test]
    fn test_self_referential_list() {
        let value = Value::list(vec![Value::Int(1)]);
        if let Value::List(items) = &value {
            items.borrow_mut().push(value.clone());
        }
        for proto in 0..=2 {
            let bytes = to_vec(&value, proto).unwrap();
            let decoded = from_slice(&bytes).unwrap();
            let Value::List(items) = &decoded else {
                panic!("expected list");
            };
            let items = items.borrow();
            assert_eq!(items[0], Value::Int(1));
            assert!(items[1].is(&decoded), "protocol {proto}: cycle broken");
        }
    }

    #[test]
    fn test_recursive_tuple() {
        // t = ([],); t[0].append(t) — the tuple reaches itself through
        // the mutable list, so saving the items memoizes the tuple and
        // the encoder must fall back to POP + GET.
        let inner = Value::list(vec![]);
        let value = Value::tuple(vec![inner.clone()]);
        if let Value::List(items) = &inner {
            items.borrow_mut().push(value.clone());
        }
        for proto in 0..=2 {
            let bytes = to_vec(&value, proto).unwrap();
            let decoded = from_slice(&bytes).unwrap();
            let Value::Tuple(items) = &decoded else {
                panic!("expected tuple");
            };
            let Value::List(inner) = &items[0] else {
                panic!("expected list inside tuple");
            };
            assert!(inner.borrow()[0].is(&decoded), "protocol {proto}: cycle broken");
        }
    }

    #[test]
    fn test_self_referential_dict() {
        let value = Value::dict(vec![]);
        if let Value::Dict(pairs) = &value {
            pairs
                .borrow_mut()
                .push((Value::string("me"), value.clone()));
        }
        let bytes = to_vec(&value, 2).unwrap();
        let decoded = from_slice(&bytes).unwrap();
        let Value::Dict(pairs) = &decoded else {
            panic!("expected dict");
        };
        assert!(pairs.borrow()[0].1.is(&decoded));
    }

    #[test]
    fn test_global_and_extension_codes() {
        let value = Value::global("collections", "OrderedDict");
        assert_eq!(
            to_vec(&value, 2).unwrap(),
            b"\x80\x02ccollections\nOrderedDict\nq\x00."
        );

        let mut reg = ExtensionRegistry::new();
        reg.register("collections", "OrderedDict", 5).unwrap();
        reg.register("collections", "deque", 800).unwrap();
        reg.register("collections", "Counter", 100_000).unwrap();

        for (global, opcode) in [
            (Value::global("collections", "OrderedDict"), EXT1),
            (Value::global("collections", "deque"), EXT2),
            (Value::global("collections", "Counter"), EXT4),
        ] {
            let mut buf = Vec::new();
            Pickler::new(&mut buf, 2)
                .unwrap()
                .with_extensions(reg.clone())
                .dump(&global)
                .unwrap();
            assert_eq!(buf[2], opcode);

            let mut unpickler =
                Unpickler::new(SliceSource::new(&buf)).with_extensions(reg.clone());
            assert_eq!(unpickler.load().unwrap(), global);
        }
    }

    #[test]
    fn test_object_round_trip() {
        for proto in 0..=2 {
            let value = Value::object(
                Value::global("mymod", "Point"),
                Value::tuple(vec![Value::Int(3), Value::Int(4)]),
                ConstructKind::Call,
            );
            if let Value::Object(obj) = &value {
                *obj.state.borrow_mut() =
                    Some(Value::dict(vec![(Value::string("name"), Value::string("p"))]));
            }
            let decoded = round_trip(&value, proto);
            assert_eq!(decoded, value, "protocol {proto}");
        }
    }

    #[test]
    fn test_newobj_only_at_protocol_2() {
        let value = Value::object(
            Value::global("mymod", "Point"),
            Value::tuple(vec![Value::Int(3)]),
            ConstructKind::New,
        );
        let bytes = to_vec(&value, 2).unwrap();
        assert!(bytes.contains(&NEWOBJ));
        assert_eq!(round_trip(&value, 2), value);

        // below protocol 2 the construction downgrades to REDUCE, so the
        // decoded instance comes back Call-constructed
        let bytes = to_vec(&value, 1).unwrap();
        assert!(!bytes.contains(&NEWOBJ));
        let Value::Object(decoded) = from_slice(&bytes).unwrap() else {
            panic!("expected instance");
        };
        assert_eq!(decoded.kind, ConstructKind::Call);
        assert_eq!(decoded.constructor, Value::global("mymod", "Point"));
    }

    #[test]
    fn test_reduction_items_round_trip() {
        let value = Value::object(
            Value::global("mymod", "Bag"),
            Value::tuple(vec![]),
            ConstructKind::Call,
        );
        if let Value::Object(obj) = &value {
            obj.list_items
                .borrow_mut()
                .extend((0..4).map(Value::Int));
            obj.dict_items
                .borrow_mut()
                .push((Value::string("k"), Value::Int(1)));
        }
        for proto in 0..=2 {
            assert_eq!(round_trip(&value, proto), value, "protocol {proto}");
        }
    }

    #[test]
    fn test_reducer_hook_overrides() {
        let value = Value::object(
            Value::global("mymod", "Secret"),
            Value::tuple(vec![]),
            ConstructKind::Call,
        );
        let mut buf = Vec::new();
        Pickler::new(&mut buf, 2)
            .unwrap()
            .with_reducer(|_| {
                Some(Reduction::new(
                    Value::global("mymod", "Replacement"),
                    Value::tuple(vec![Value::Int(1)]),
                ))
            })
            .dump(&value)
            .unwrap();
        let Value::Object(decoded) = from_slice(&buf).unwrap() else {
            panic!("expected instance");
        };
        assert_eq!(decoded.constructor, Value::global("mymod", "Replacement"));
    }

    #[test]
    fn test_malformed_reduction_is_pickling_error() {
        let value = Value::object(
            Value::string("not a callable"),
            Value::tuple(vec![]),
            ConstructKind::Call,
        );
        let err = to_vec(&value, 2).unwrap_err();
        assert!(matches!(err, Error::Pickling(_)));
        assert!(err.to_string().contains("not a callable"));

        let value = Value::object(
            Value::global("mymod", "Cls"),
            Value::list(vec![]),
            ConstructKind::Call,
        );
        let err = to_vec(&value, 2).unwrap_err();
        assert!(err.to_string().contains("must be a tuple"));
    }

    #[test]
    fn test_persistent_id_round_trip() {
        let value = Value::list(vec![Value::string("ordinary"), Value::Int(3)]);
        for proto in 0..=2 {
            let mut buf = Vec::new();
            Pickler::new(&mut buf, proto)
                .unwrap()
                .with_persistent_id(|v| match v {
                    Value::String(s) if s.as_str() == "ordinary" => Some("oid-17".to_string()),
                    _ => None,
                })
                .dump(&value)
                .unwrap();

            let mut unpickler = Unpickler::new(SliceSource::new(&buf))
                .with_persistent_load(|pid| Ok(Value::tuple(vec![Value::string("ref"), pid])));
            let decoded = unpickler.load().unwrap();
            assert_eq!(
                decoded,
                Value::list(vec![
                    Value::tuple(vec![Value::string("ref"), Value::string("oid-17")]),
                    Value::Int(3),
                ]),
                "protocol {proto}"
            );
        }
    }

    #[test]
    fn test_memo_shared_across_dumps() {
        let shared = Value::list(vec![Value::Int(1)]);
        let mut buf = Vec::new();
        let mut pickler = Pickler::new(&mut buf, 2).unwrap();
        pickler.dump(&shared).unwrap();
        pickler.dump(&shared).unwrap();

        let mut unpickler = Unpickler::new(SliceSource::new(&buf));
        let first = unpickler.load().unwrap();
        let second = unpickler.load().unwrap();
        assert!(first.is(&second), "second pickle must back-reference the first");

        // clearing the memo severs the link
        let mut buf = Vec::new();
        let mut pickler = Pickler::new(&mut buf, 2).unwrap();
        pickler.dump(&shared).unwrap();
        pickler.clear_memo();
        pickler.dump(&shared).unwrap();
        let mut unpickler = Unpickler::new(SliceSource::new(&buf));
        let first = unpickler.load().unwrap();
        let second = unpickler.load().unwrap();
        assert!(!first.is(&second));
        assert_eq!(first, second);
    }

    #[test]
    fn test_wide_memo_ids_round_trip() {
        // more than 256 memoized nodes forces the 4-byte memo opcodes
        let uniques: Vec<Value> = (0..300).map(|i| Value::string(format!("s{i}"))).collect();
        let mut items = uniques.clone();
        items.extend(uniques.iter().cloned());
        let value = Value::list(items);

        let bytes = to_vec(&value, 2).unwrap();
        assert!(bytes.contains(&LONG_BINPUT));
        assert!(bytes.contains(&LONG_BINGET));

        let Value::List(decoded) = from_slice(&bytes).unwrap() else {
            panic!("expected list");
        };
        let decoded = decoded.borrow();
        assert_eq!(decoded.len(), 600);
        for i in 0..300 {
            assert!(decoded[i].is(&decoded[i + 300]), "element {i} lost sharing");
        }
    }

    #[test]
    fn test_protocol_monotonicity() {
        let value = Value::dict(vec![
            (Value::string("xs"), Value::list((0..10).map(Value::Int).collect())),
            (Value::string("t"), Value::tuple(vec![Value::Bool(true), Value::Float(0.5)])),
        ]);
        let mut streams = Vec::new();
        for proto in 0..=2 {
            streams.push(to_vec(&value, proto).unwrap());
        }
        for (proto, bytes) in streams.iter().enumerate() {
            assert_eq!(from_slice(bytes).unwrap(), value, "protocol {proto}");
        }
    }

    #[test]
    fn test_rejects_unsupported_protocol() {
        let err = to_vec(&Value::None, 3).unwrap_err();
        assert!(matches!(err, Error::UnsupportedProtocol(3)));
    }

    #[test]
    fn test_memo_introspection() {
        let shared = Value::string("shared");
        let value = Value::list(vec![shared.clone(), shared.clone()]);
        let mut pickler = Pickler::new(Vec::new(), 2).unwrap();
        pickler.dump(&value).unwrap();
        let entries: Vec<(u32, Value)> = pickler
            .memo()
            .entries()
            .map(|(id, v)| (id, v.clone()))
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, 0);
        assert!(entries[0].1.is(&value));
        assert!(entries[1].1.is(&shared));
    }
}
