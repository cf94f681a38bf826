//! Stored procedures and their parameter sets.

use bytes::{BufMut, BytesMut};

use crate::error::{WireError, WireResult};
use crate::value::Value;

/// The ordered parameter vector of a procedure.
///
/// The arity is fixed at construction; slots may be rewritten between
/// invocations. Serialization requires every slot to be bound.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    slots: Vec<Option<Value>>,
}

impl ParameterSet {
    /// Creates a parameter set with `arity` unbound slots.
    pub fn new(arity: usize) -> Self {
        Self {
            slots: vec![None; arity],
        }
    }

    /// Number of declared slots.
    pub fn arity(&self) -> usize {
        self.slots.len()
    }

    /// Binds (or rebinds) a slot.
    pub fn set(&mut self, index: usize, value: Value) -> WireResult<()> {
        let arity = self.arity();
        match self.slots.get_mut(index) {
            Some(slot) => {
                *slot = Some(value);
                Ok(())
            }
            None => Err(WireError::ParamIndexOutOfRange { index, arity }),
        }
    }

    /// Unbinds every slot.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// True when every declared slot is bound.
    pub fn is_fully_bound(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Serializes the set: an `i16` count followed by each tagged value.
    /// Fails on the first unbound slot.
    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        buf.put_i16(self.arity() as i16);
        for (index, slot) in self.slots.iter().enumerate() {
            let value = slot
                .as_ref()
                .ok_or(WireError::UninitializedParam { index })?;
            value.encode(buf)?;
        }
        Ok(())
    }
}

/// A named server-side routine plus the parameters for its next invocation.
///
/// Reusable: rewrite the parameter slots and submit again.
#[derive(Debug, Clone)]
pub struct Procedure {
    name: String,
    params: ParameterSet,
}

impl Procedure {
    /// Longest procedure name the wire can carry, in UTF-8 bytes.
    pub const MAX_NAME_LEN: usize = 255;

    /// Creates a procedure with `param_count` unbound parameter slots.
    pub fn new(name: impl Into<String>, param_count: usize) -> Self {
        Self {
            name: name.into(),
            params: ParameterSet::new(param_count),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    /// Binds (or rebinds) a parameter slot.
    pub fn set_param(&mut self, index: usize, value: Value) -> WireResult<()> {
        self.params.set(index, value)
    }
}
