use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use num_bigint::BigInt;

/// In-memory representation of a pickled value graph.
///
/// Compound variants are `Rc`-shared: cloning a `Value` is shallow and
/// clones share identity, which is what the encoder's memo keys on and
/// what lets shared references and cycles survive a round trip. Lists,
/// dicts and object state carry `RefCell` because the protocol mutates
/// them in place (APPEND/SETITEM/BUILD).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Arbitrary-precision integer. Holds only values outside `i64`
    /// range; longs that fit decode to `Int`.
    BigInt(BigInt),
    Float(f64),
    String(Rc<String>),
    /// The protocol's 8-bit string kind (STRING/BINSTRING opcodes).
    Bytes(Rc<Vec<u8>>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    /// Insertion-ordered key/value pairs.
    Dict(Rc<RefCell<Vec<(Value, Value)>>>),
    /// A class/callable reference: (module, qualified name).
    Global(Rc<Global>),
    /// A symbolic instance: the decoded image of a reduction.
    Object(Rc<Object>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Global {
    pub module: String,
    pub name: String,
}

/// How an [`Object`] is rebuilt from its constructor and arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructKind {
    /// `constructor(*args)` — REDUCE, INST and OBJ.
    Call,
    /// `constructor.__new__(constructor, *args)` — NEWOBJ.
    New,
}

/// A compound instance the engine cannot (or need not) materialize:
/// constructor reference, argument tuple, and the mutable parts that
/// BUILD/APPENDS/SETITEMS fill in afterwards.
#[derive(Debug, PartialEq)]
pub struct Object {
    pub constructor: Value,
    pub args: Value,
    pub kind: ConstructKind,
    pub state: RefCell<Option<Value>>,
    pub list_items: RefCell<Vec<Value>>,
    pub dict_items: RefCell<Vec<(Value, Value)>>,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(Rc::new(s.into()))
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(Rc::new(b.into()))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(pairs: Vec<(Value, Value)>) -> Value {
        Value::Dict(Rc::new(RefCell::new(pairs)))
    }

    pub fn global(module: impl Into<String>, name: impl Into<String>) -> Value {
        Value::Global(Rc::new(Global {
            module: module.into(),
            name: name.into(),
        }))
    }

    /// Wrap a big integer, normalizing values that fit `i64` to `Int`.
    pub fn from_bigint(value: BigInt) -> Value {
        match i64::try_from(&value) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::BigInt(value),
        }
    }

    /// A fresh instance node with empty state and item vectors.
    pub fn object(constructor: Value, args: Value, kind: ConstructKind) -> Value {
        Value::Object(Rc::new(Object {
            constructor,
            args,
            kind,
            state: RefCell::new(None),
            list_items: RefCell::new(Vec::new()),
            dict_items: RefCell::new(Vec::new()),
        }))
    }

    /// Identity key for memoization: the `Rc` allocation address of a
    /// compound variant. Scalars have no identity and are never
    /// memoized.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::None
            | Value::Bool(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::Float(_) => None,
            Value::String(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Bytes(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::List(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Tuple(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Dict(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Global(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Object(rc) => Some(Rc::as_ptr(rc) as usize),
        }
    }

    /// True if two values are the same node (pointer identity), not
    /// merely equal by content. Scalars are never identical.
    pub fn is(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth > 2 {
            return match self {
                Value::List(_) => write!(f, "[...]"),
                Value::Tuple(_) => write!(f, "(...)"),
                Value::Dict(_) => write!(f, "{{...}}"),
                Value::Object(_) => write!(f, "<...>"),
                other => other.fmt_depth(f, 0),
            };
        }
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BigInt(bi) => write!(f, "{bi}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{:?}", s.as_str()),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().take(8).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_depth(f, depth + 1)?;
                }
                if items.borrow().len() > 8 {
                    write!(f, ", ...")?;
                }
                write!(f, "]")
            }
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().take(8).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_depth(f, depth + 1)?;
                }
                if items.len() > 8 {
                    write!(f, ", ...")?;
                }
                write!(f, ")")
            }
            Value::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.borrow().iter().take(8).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    k.fmt_depth(f, depth + 1)?;
                    write!(f, ": ")?;
                    v.fmt_depth(f, depth + 1)?;
                }
                if pairs.borrow().len() > 8 {
                    write!(f, ", ...")?;
                }
                write!(f, "}}")
            }
            Value::Global(g) => write!(f, "{}.{}", g.module, g.name),
            Value::Object(obj) => {
                write!(f, "<")?;
                obj.constructor.fmt_depth(f, depth + 1)?;
                write!(f, " instance>")
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

/// Merge `src` pairs into `dst`, replacing entries with equal keys and
/// appending the rest, preserving insertion order.
pub(crate) fn dict_merge(dst: &mut Vec<(Value, Value)>, src: Vec<(Value, Value)>) {
    for (key, value) in src {
        if let Some(entry) = dst.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            dst.push((key, value));
        }
    }
}
