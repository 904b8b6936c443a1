//! Named typed variables with `[name]` interpolation.
//!
//! The store is an array ordered by case-insensitive invariant
//! comparison of names and binary searched on every lookup. Built-in
//! variables are registered at construction with lazy initializers
//! that run on first read; an initializer that fails leaves the
//! variable as type-none and reads keep returning not-found.

mod builtins;

use std::{cmp::Ordering, sync::Mutex};

use tracing::debug;

use crate::{
    error::{EmberError, EmberResult},
    version::Version,
};

/// Value of a variable. Type-none variables exist (declared or
/// failed-to-initialize) but read as not-found.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VariableValue {
    #[default]
    None,
    Numeric(i64),
    String(String),
    Version(Version),
}

impl VariableValue {
    fn type_tag(&self) -> u32 {
        match self {
            VariableValue::None => 0,
            VariableValue::Numeric(_) => 1,
            VariableValue::String(_) => 2,
            VariableValue::Version(_) => 3,
        }
    }
}

type BuiltInInit = fn() -> Option<VariableValue>;

struct Variable {
    name: String,
    value: VariableValue,
    built_in: bool,
    hidden: bool,
    persisted: bool,
    initializer: Option<BuiltInInit>,
}

/// Case-insensitive invariant comparison used for the name order.
fn invariant_cmp(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

/// The variable store. All public operations serialize behind an
/// exclusive section.
pub struct Variables {
    inner: Mutex<Vec<Variable>>,
}

impl Default for Variables {
    fn default() -> Self {
        Self::new()
    }
}

impl Variables {
    /// Creates a store with every built-in registered.
    pub fn new() -> Self {
        let store = Self {
            inner: Mutex::new(Vec::new()),
        };
        {
            let mut inner = store.inner.lock().unwrap_or_else(|e| e.into_inner());
            for &(name, initializer) in builtins::BUILT_IN_VARIABLES {
                let index = match inner
                    .binary_search_by(|v| invariant_cmp(&v.name, name))
                {
                    Ok(_) => continue,
                    Err(index) => index,
                };
                inner.insert(
                    index,
                    Variable {
                        name: name.to_string(),
                        value: VariableValue::None,
                        built_in: true,
                        hidden: false,
                        persisted: false,
                        initializer: Some(initializer),
                    },
                );
            }
        }
        store
    }

    /// Creates an empty store with no built-ins. Deserialized stores in
    /// tests start from this.
    pub fn empty() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Declares a manifest-authored variable with flags. Rejects names
    /// that collide with built-ins.
    pub fn declare(
        &self,
        name: &str,
        value: VariableValue,
        hidden: bool,
        persisted: bool,
    ) -> EmberResult<()> {
        let mut inner = self.inner.lock()?;
        match inner.binary_search_by(|v| invariant_cmp(&v.name, name)) {
            Ok(index) => {
                if inner[index].built_in {
                    return Err(EmberError::BuiltInOverwrite(name.to_string()));
                }
                inner[index].value = value;
                inner[index].hidden = hidden;
                inner[index].persisted = persisted;
            }
            Err(index) => {
                inner.insert(
                    index,
                    Variable {
                        name: name.to_string(),
                        value,
                        built_in: false,
                        hidden,
                        persisted,
                        initializer: None,
                    },
                );
            }
        }
        Ok(())
    }

    fn resolve(inner: &mut [Variable], index: usize) -> VariableValue {
        let variable = &mut inner[index];
        if let Some(initializer) = variable.initializer.take() {
            if let Some(value) = initializer() {
                variable.value = value;
            }
        }
        variable.value.clone()
    }

    fn lookup(&self, name: &str) -> EmberResult<VariableValue> {
        let mut inner = self.inner.lock()?;
        match inner.binary_search_by(|v| invariant_cmp(&v.name, name)) {
            Ok(index) => {
                let value = Self::resolve(&mut inner, index);
                if value == VariableValue::None {
                    Err(EmberError::VariableNotFound(name.to_string()))
                } else {
                    Ok(value)
                }
            }
            Err(_) => Err(EmberError::VariableNotFound(name.to_string())),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lookup(name).is_ok()
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .binary_search_by(|v| invariant_cmp(&v.name, name))
            .map(|index| inner[index].hidden)
            .unwrap_or(false)
    }

    /// Returns the raw value, resolving a built-in initializer if one
    /// is pending. Type-none reads as not-found.
    pub fn get_value(&self, name: &str) -> EmberResult<VariableValue> {
        self.lookup(name)
    }

    pub fn get_numeric(&self, name: &str) -> EmberResult<i64> {
        match self.lookup(name)? {
            VariableValue::Numeric(value) => Ok(value),
            VariableValue::String(s) => s.trim().parse::<i64>().map_err(|_| {
                EmberError::Validation(format!("variable '{name}' is not numeric: '{s}'"))
            }),
            VariableValue::Version(v) => Ok(v.as_raw() as i64),
            VariableValue::None => Err(EmberError::VariableNotFound(name.to_string())),
        }
    }

    pub fn get_string(&self, name: &str) -> EmberResult<String> {
        match self.lookup(name)? {
            VariableValue::String(s) => Ok(s),
            VariableValue::Numeric(value) => Ok(value.to_string()),
            VariableValue::Version(v) => Ok(v.to_string()),
            VariableValue::None => Err(EmberError::VariableNotFound(name.to_string())),
        }
    }

    pub fn get_version(&self, name: &str) -> EmberResult<Version> {
        match self.lookup(name)? {
            VariableValue::Version(v) => Ok(v),
            VariableValue::Numeric(value) => Ok(Version::from_raw(value as u64)),
            VariableValue::String(s) => s.parse(),
            VariableValue::None => Err(EmberError::VariableNotFound(name.to_string())),
        }
    }

    pub fn set_numeric(
        &self,
        name: &str,
        value: i64,
        overwrite_built_in: bool,
    ) -> EmberResult<()> {
        self.set_value(name, VariableValue::Numeric(value), overwrite_built_in)
    }

    pub fn set_string(
        &self,
        name: &str,
        value: &str,
        overwrite_built_in: bool,
    ) -> EmberResult<()> {
        self.set_value(
            name,
            VariableValue::String(value.to_string()),
            overwrite_built_in,
        )
    }

    pub fn set_version(
        &self,
        name: &str,
        value: Version,
        overwrite_built_in: bool,
    ) -> EmberResult<()> {
        self.set_value(name, VariableValue::Version(value), overwrite_built_in)
    }

    /// Sets a variable. Built-ins reject the write unless
    /// `overwrite_built_in` is given (the engine's restore path).
    pub fn set_value(
        &self,
        name: &str,
        value: VariableValue,
        overwrite_built_in: bool,
    ) -> EmberResult<()> {
        let mut inner = self.inner.lock()?;
        match inner.binary_search_by(|v| invariant_cmp(&v.name, name)) {
            Ok(index) => {
                if inner[index].built_in && !overwrite_built_in {
                    debug!(variable = name, "rejected write to built-in variable");
                    return Err(EmberError::BuiltInOverwrite(name.to_string()));
                }
                inner[index].initializer = None;
                inner[index].value = value;
            }
            Err(index) => {
                inner.insert(
                    index,
                    Variable {
                        name: name.to_string(),
                        value,
                        built_in: false,
                        hidden: false,
                        persisted: false,
                        initializer: None,
                    },
                );
            }
        }
        Ok(())
    }

    /// Expands `[name]` references in `input`.
    ///
    /// `[\c]` emits the single character `c`, `[]` and an unterminated
    /// `[` are emitted literally, and a missing variable expands to
    /// the empty string.
    pub fn format_string(&self, input: &str) -> EmberResult<String> {
        self.format_internal(input, false)
    }

    /// Like [`Variables::format_string`] but hidden variables render
    /// as `*****`. Log lines go through this variant.
    pub fn format_string_obfuscated(&self, input: &str) -> EmberResult<String> {
        self.format_internal(input, true)
    }

    fn format_internal(&self, input: &str, obfuscate: bool) -> EmberResult<String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        loop {
            let Some(open) = rest.find('[') else {
                out.push_str(rest);
                break;
            };

            let Some(close_offset) = rest[open + 1..].find(']') else {
                // unterminated expander is literal
                out.push_str(rest);
                break;
            };
            let close = open + 1 + close_offset;
            let inner = &rest[open + 1..close];

            if inner.is_empty() {
                // blank expander is literal, brackets included
                out.push_str(&rest[..=close]);
            } else {
                out.push_str(&rest[..open]);

                let mut chars = inner.chars();
                if inner.len() >= 2 && inner.starts_with('\\') {
                    chars.next();
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if obfuscate && self.is_hidden(inner) {
                    out.push_str("*****");
                } else {
                    match self.get_string(inner) {
                        Ok(value) => out.push_str(&value),
                        Err(EmberError::VariableNotFound(_)) => {}
                        Err(err) => return Err(err),
                    }
                }
            }

            rest = &rest[close + 1..];
        }

        Ok(out)
    }

    /// Escapes `[`, `]`, `{`, and `}` so the result formats back to
    /// the input.
    pub fn escape_string(input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        for c in input.chars() {
            match c {
                '[' | ']' | '{' | '}' => {
                    out.push('[');
                    out.push('\\');
                    out.push(c);
                    out.push(']');
                }
                _ => out.push(c),
            }
        }
        out
    }

    /// Serializes the store little-endian: `count`, then per record an
    /// `included` flag followed (when included) by name, type, and
    /// payload. Built-ins are never included; `persist_only`
    /// additionally filters on the persisted flag. Excluded records
    /// still occupy their flag slot.
    pub fn serialize(&self, persist_only: bool) -> EmberResult<Vec<u8>> {
        let inner = self.inner.lock()?;
        let mut buffer = Vec::new();

        write_u32(&mut buffer, inner.len() as u32);

        for variable in inner.iter() {
            let mut included = !variable.built_in;
            if persist_only && !variable.persisted {
                included = false;
            }

            write_u32(&mut buffer, u32::from(included));
            if !included {
                continue;
            }

            write_string(&mut buffer, &variable.name);
            write_u32(&mut buffer, variable.value.type_tag());
            match &variable.value {
                VariableValue::None => {}
                VariableValue::Numeric(value) => {
                    buffer.extend_from_slice(&value.to_le_bytes());
                }
                VariableValue::Version(v) => {
                    buffer.extend_from_slice(&v.as_raw().to_le_bytes());
                }
                VariableValue::String(s) => write_string(&mut buffer, s),
            }
        }

        Ok(buffer)
    }

    /// Restores variables from a serialized stream. Built-ins cannot
    /// be overwritten through this path.
    pub fn deserialize(&self, data: &[u8]) -> EmberResult<()> {
        let mut cursor = Cursor::new(data);
        let count = cursor.read_u32()?;

        for _ in 0..count {
            let included = cursor.read_u32()?;
            if included == 0 {
                continue;
            }

            let name = cursor.read_string()?;
            let type_tag = cursor.read_u32()?;
            let value = match type_tag {
                0 => VariableValue::None,
                1 => VariableValue::Numeric(i64::from_le_bytes(cursor.read_array()?)),
                3 => VariableValue::Version(Version::from_raw(u64::from_le_bytes(
                    cursor.read_array()?,
                ))),
                2 => VariableValue::String(cursor.read_string()?),
                other => {
                    return Err(EmberError::Validation(format!(
                        "unsupported variable type tag {other}"
                    )))
                }
            };

            self.set_value(&name, value, false)?;
        }

        Ok(())
    }

    /// Names in store order, for order-invariant assertions.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.iter().map(|v| v.name.clone()).collect()
    }
}

fn write_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_le_bytes());
}

fn write_string(buffer: &mut Vec<u8>, value: &str) {
    write_u32(buffer, value.len() as u32);
    buffer.extend_from_slice(value.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> EmberResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                EmberError::Validation("truncated variable stream".to_string())
            })?;
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> EmberResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_array<const N: usize>(&mut self) -> EmberResult<[u8; N]> {
        let bytes = self.take(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    fn read_string(&mut self) -> EmberResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| EmberError::Validation("invalid UTF-8 in variable stream".to_string()))
    }
}
