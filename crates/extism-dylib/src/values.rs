//! Value types shared between the host and the native runtime.
//!
//! [`ValType`] mirrors the native tag enum; [`Val`] is the safe tagged
//! value the bridge marshals. Only the four numeric kinds carry a
//! payload this bridge can use; the reference kinds exist so signatures
//! can be declared faithfully but are rejected at the marshaling seam.

use std::fmt;

use crate::error::{Error, Result};
use crate::sys;

/// Wasm value type, with the same discriminants as the native ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32 = 0,
    I64 = 1,
    F32 = 2,
    F64 = 3,
    V128 = 4,
    FuncRef = 5,
    ExternRef = 6,
}

impl ValType {
    /// Alias for the type used to pass memory-block offsets.
    pub const PTR: ValType = ValType::I64;

    pub(crate) fn to_raw(self) -> i32 {
        self as i32
    }

    pub(crate) fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(ValType::I32),
            1 => Some(ValType::I64),
            2 => Some(ValType::F32),
            3 => Some(ValType::F64),
            4 => Some(ValType::V128),
            5 => Some(ValType::FuncRef),
            6 => Some(ValType::ExternRef),
            _ => None,
        }
    }

    /// Whether this kind carries a numeric payload the bridge can marshal.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValType::I32 | ValType::I64 | ValType::F32 | ValType::F64
        )
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
            ValType::V128 => write!(f, "v128"),
            ValType::FuncRef => write!(f, "funcref"),
            ValType::ExternRef => write!(f, "externref"),
        }
    }
}

/// A numeric wasm value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Val {
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Val::I32(v) => Some(*v),
            Val::I64(v) => Some(*v as i32),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Val::I32(v) => Some(*v as i64),
            Val::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Val::F32(v) => Some(*v),
            Val::F64(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Val::F32(v) => Some(*v as f64),
            Val::F64(v) => Some(*v),
            _ => None,
        }
    }

    /// Decode a native tagged value. Reference kinds have no payload
    /// this bridge can represent and are rejected.
    pub(crate) fn from_raw(raw: &sys::ExtismVal) -> Result<Self> {
        let ty = ValType::from_raw(raw.t)
            .ok_or_else(|| Error::UnsupportedType(format!("tag {}", raw.t)))?;
        // Safety: the tag selects the union member the runtime wrote.
        match ty {
            ValType::I32 => Ok(Val::I32(unsafe { raw.v.i32_ })),
            ValType::I64 => Ok(Val::I64(unsafe { raw.v.i64_ })),
            ValType::F32 => Ok(Val::F32(unsafe { raw.v.f32_ })),
            ValType::F64 => Ok(Val::F64(unsafe { raw.v.f64_ })),
            other => Err(Error::UnsupportedType(other.to_string())),
        }
    }

    pub(crate) fn to_raw(self) -> sys::ExtismVal {
        match self {
            Val::I32(v) => sys::ExtismVal {
                t: ValType::I32.to_raw(),
                v: sys::ExtismValUnion { i32_: v },
            },
            Val::I64(v) => sys::ExtismVal {
                t: ValType::I64.to_raw(),
                v: sys::ExtismValUnion { i64_: v },
            },
            Val::F32(v) => sys::ExtismVal {
                t: ValType::F32.to_raw(),
                v: sys::ExtismValUnion { f32_: v },
            },
            Val::F64(v) => sys::ExtismVal {
                t: ValType::F64.to_raw(),
                v: sys::ExtismValUnion { f64_: v },
            },
        }
    }
}

impl From<i32> for Val {
    fn from(v: i32) -> Self {
        Val::I32(v)
    }
}

impl From<i64> for Val {
    fn from(v: i64) -> Self {
        Val::I64(v)
    }
}

impl From<f32> for Val {
    fn from(v: f32) -> Self {
        Val::F32(v)
    }
}

impl From<f64> for Val {
    fn from(v: f64) -> Self {
        Val::F64(v)
    }
}

/// Write `value` into an output slot, coercing to the slot's declared
/// kind. The slot tag is owned by the native runtime and is never
/// changed from this side.
pub(crate) fn write_to_slot(value: Val, slot: &mut sys::ExtismVal) -> Result<()> {
    let declared = ValType::from_raw(slot.t)
        .ok_or_else(|| Error::UnsupportedType(format!("output tag {}", slot.t)))?;
    match declared {
        ValType::I32 => {
            slot.v.i32_ = value
                .as_i32()
                .ok_or_else(|| mismatch(value, declared))?;
        }
        ValType::I64 => {
            slot.v.i64_ = value
                .as_i64()
                .ok_or_else(|| mismatch(value, declared))?;
        }
        ValType::F32 => {
            slot.v.f32_ = value
                .as_f32()
                .ok_or_else(|| mismatch(value, declared))?;
        }
        ValType::F64 => {
            slot.v.f64_ = value
                .as_f64()
                .ok_or_else(|| mismatch(value, declared))?;
        }
        other => return Err(Error::UnsupportedType(format!("output of type {other}"))),
    }
    Ok(())
}

/// Zero an output slot, preserving its declared kind. Used as the safe
/// default when a host callback fails.
pub(crate) fn zero_slot(slot: &mut sys::ExtismVal) {
    slot.v = sys::ExtismValUnion { i64_: 0 };
}

fn mismatch(value: Val, declared: ValType) -> Error {
    Error::UnsupportedType(format!(
        "cannot write {} value into {declared} output",
        value.ty()
    ))
}
