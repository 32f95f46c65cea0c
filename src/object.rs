use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::value::{dict_merge, ConstructKind, Global, Object, Value};

/// The reduction protocol quintuple: how a compound value is rebuilt.
///
/// `callable` applied to `args` produces the bare object; `state` is
/// applied afterwards with BUILD; `list_items`/`dict_items` are fed to
/// it with batched APPENDS/SETITEMS.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub callable: Value,
    pub args: Value,
    /// Whether the encoder may use the NEWOBJ form (protocol >= 2).
    pub kind: ConstructKind,
    pub state: Option<Value>,
    pub list_items: Vec<Value>,
    pub dict_items: Vec<(Value, Value)>,
}

impl Reduction {
    pub fn new(callable: Value, args: Value) -> Reduction {
        Reduction {
            callable,
            args,
            kind: ConstructKind::Call,
            state: None,
            list_items: Vec::new(),
            dict_items: Vec::new(),
        }
    }
}

impl Object {
    /// Canonical reduction of a symbolic instance: its own constructor,
    /// arguments and accumulated mutable parts.
    pub fn reduction(&self) -> Reduction {
        Reduction {
            callable: self.constructor.clone(),
            args: self.args.clone(),
            kind: self.kind,
            state: self.state.borrow().clone(),
            list_items: self.list_items.borrow().clone(),
            dict_items: self.dict_items.borrow().clone(),
        }
    }
}

/// The seam to the host object model.
///
/// The decoder routes every construct it cannot build generically
/// through this trait: global lookup, calling a constructor, the
/// NEWOBJ construction form, and state application. The default
/// methods implement the symbolic model — globals stay name pairs and
/// instances become [`Object`] nodes — so a decoder without a host
/// still yields a faithful, re-encodable value graph. An embedding
/// that materializes real objects supplies its own implementation.
pub trait ObjectModel {
    /// Resolve a (module, qualified name) pair.
    fn find_global(&self, module: &str, name: &str) -> Result<Value> {
        Ok(Value::global(module, name))
    }

    /// Apply `callable` to an argument tuple (REDUCE, INST, OBJ).
    fn call(&self, callable: Value, args: Value) -> Result<Value> {
        Ok(Value::object(callable, args, ConstructKind::Call))
    }

    /// Construct through the class's "new" hook (NEWOBJ).
    fn new_object(&self, class: Value, args: Value) -> Result<Value> {
        Ok(Value::object(class, args, ConstructKind::New))
    }

    /// Apply BUILD state to `obj`.
    ///
    /// The default stores a first state as-is (the state-setter case)
    /// and merges repeated dict states — including the dict and slots
    /// halves of a 2-tuple state — into the existing state dict.
    fn set_state(&self, obj: &Value, state: Value) -> Result<()> {
        let Value::Object(inst) = obj else {
            return Err(Error::Unpickling(format!("BUILD on non-instance value {obj}")));
        };
        let mut slot = inst.state.borrow_mut();
        let current = match slot.take() {
            None => {
                *slot = Some(state);
                return Ok(());
            }
            Some(current) => current,
        };
        match (&current, &state) {
            (Value::Dict(existing), Value::Dict(incoming)) => {
                // merging a dict into itself is a no-op (and would alias)
                if !Rc::ptr_eq(existing, incoming) {
                    dict_merge(&mut existing.borrow_mut(), incoming.borrow().clone());
                }
                *slot = Some(current);
            }
            (Value::Dict(existing), Value::Tuple(parts)) if parts.len() == 2 => {
                for part in parts.iter() {
                    match part {
                        Value::Dict(pairs) if !Rc::ptr_eq(existing, pairs) => {
                            dict_merge(&mut existing.borrow_mut(), pairs.borrow().clone());
                        }
                        Value::Dict(_) | Value::None => {}
                        other => {
                            return Err(Error::Unpickling(format!(
                                "state for instance must be None, dict, or 2-tuple of dicts, got {other}"
                            )));
                        }
                    }
                }
                *slot = Some(current);
            }
            _ => {
                *slot = Some(state);
            }
        }
        Ok(())
    }
}

/// The no-host model: every default method of [`ObjectModel`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SymbolicModel;

impl ObjectModel for SymbolicModel {}

/// Bidirectional (module, name) ↔ extension-code registry, the
/// protocol-2 shortcut for frequently pickled globals. Clone one
/// registry into both the pickler and the unpickler so codes agree.
#[derive(Debug, Default, Clone)]
pub struct ExtensionRegistry {
    by_name: HashMap<Global, i32>,
    by_code: HashMap<i32, Global>,
}

impl ExtensionRegistry {
    pub fn new() -> ExtensionRegistry {
        ExtensionRegistry::default()
    }

    /// Register a global under a positive extension code. Re-registering
    /// the same pair under the same code is a no-op; any conflicting
    /// registration is an error.
    pub fn register(
        &mut self,
        module: impl Into<String>,
        name: impl Into<String>,
        code: i32,
    ) -> Result<()> {
        if code <= 0 {
            return Err(Error::OutOfRange(format!(
                "extension code {code} must be positive"
            )));
        }
        let global = Global {
            module: module.into(),
            name: name.into(),
        };
        match (self.by_code.get(&code), self.by_name.get(&global)) {
            (None, None) => {
                self.by_name.insert(global.clone(), code);
                self.by_code.insert(code, global);
                Ok(())
            }
            (Some(existing), Some(&existing_code))
                if *existing == global && existing_code == code =>
            {
                Ok(())
            }
            _ => Err(Error::OutOfRange(format!(
                "extension code {code} conflicts with an existing registration"
            ))),
        }
    }

    pub fn code_for(&self, global: &Global) -> Option<i32> {
        self.by_name.get(global).copied()
    }

    pub fn resolve(&self, code: i32) -> Option<&Global> {
        self.by_code.get(&code)
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}
