//! Encoder and decoder for the stack-based pickle serialization
//! format, protocols 0 through 2.
//!
//! # Format
//!
//! A pickle is a one-byte opcode stream interpreted against an operand
//! stack: scalar opcodes push literals, container opcodes fold
//! mark-delimited stack slices, and memo opcodes turn repeated
//! references into back-references, so shared structure and cycles
//! survive a round trip. Protocol 0 is newline-terminated text;
//! protocols 1 and 2 add counted binary forms.
//!
//! # Values
//!
//! Streams decode into [`Value`], a closed graph node covering the
//! protocol's built-in types:
//!
//! * `None`, booleans, `i64` integers and bigints, floats
//! * text strings (`String`) and 8-bit strings (`Bytes`)
//! * lists, tuples and insertion-ordered dicts
//! * class references (`Global`) and symbolic instances (`Object`)
//!
//! Compound values are shared nodes: cloning is shallow, and the
//! encoder memoizes by node identity, not by content.
//!
//! # Hosts
//!
//! The engine never touches a runtime's object system directly.
//! Instance construction and global lookup go through the
//! [`ObjectModel`] trait (symbolic by default), persistent ids through
//! the hooks on [`Pickler`] and [`Unpickler`].
//!
//! ```
//! use pickle_codec::{from_slice, to_vec, Value};
//!
//! let value = Value::list(vec![Value::Int(1), Value::string("two")]);
//! let bytes = to_vec(&value, 2)?;
//! assert_eq!(from_slice(&bytes)?, value);
//! # Ok::<(), pickle_codec::Error>(())
//! ```

mod decode;
mod encode;
mod error;
mod memo;
mod object;
mod opcodes;
mod read;
mod value;

pub use crate::decode::{from_reader, from_slice, Unpickler};
pub use crate::encode::{to_vec, to_writer, Pickler};
pub use crate::error::{Error, Result};
pub use crate::memo::MemoTable;
pub use crate::object::{ExtensionRegistry, ObjectModel, Reduction, SymbolicModel};
pub use crate::read::{ByteSource, IoSource, SliceSource};
pub use crate::value::{ConstructKind, Global, Object, Value};

/// Highest protocol version this crate reads and writes.
pub const HIGHEST_PROTOCOL: u8 = 2;
