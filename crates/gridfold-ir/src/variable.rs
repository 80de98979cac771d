use core::fmt::Display;

use float_ord::FloatOrd;

use crate::{ElemType, Type};

/// Identity of an SSA value produced by an instruction or φ-node. Ids are
/// unique within a procedure and carried verbatim by clones, so the same id
/// addresses "the same value" across every clone of a kernel.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl Display for InstId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A scalar constant. Floats are wrapped in [`FloatOrd`] so constants can key
/// hash maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstantValue {
    Int(i64, ElemType),
    UInt(u64, ElemType),
    Float(FloatOrd<f64>, ElemType),
    Bool(bool),
}

impl ConstantValue {
    pub fn ty(&self) -> Type {
        match self {
            ConstantValue::Int(_, elem) => Type::Scalar(*elem),
            ConstantValue::UInt(_, elem) => Type::Scalar(*elem),
            ConstantValue::Float(_, elem) => Type::Scalar(*elem),
            ConstantValue::Bool(_) => Type::Scalar(ElemType::Bool),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            ConstantValue::Int(val, _) => *val,
            ConstantValue::UInt(val, _) => *val as i64,
            ConstantValue::Float(val, _) => val.0 as i64,
            ConstantValue::Bool(val) => *val as i64,
        }
    }
}

/// A constant expression embedded in an operand: address computations rooted
/// at a global or procedure address. These are flattened into instructions
/// before any shared-global rewriting happens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstExpr {
    GlobalAddr(String),
    ProcAddr(String),
    FieldAddr(Box<ConstExpr>, u32),
    IndexAddr(Box<ConstExpr>, i64),
    Cast(Box<ConstExpr>, Type),
}

impl ConstExpr {
    /// Whether this expression transitively refers to a symbol for which
    /// `pred` holds.
    pub fn references(&self, pred: &mut impl FnMut(&str, bool) -> bool) -> bool {
        match self {
            ConstExpr::GlobalAddr(name) => pred(name, false),
            ConstExpr::ProcAddr(name) => pred(name, true),
            ConstExpr::FieldAddr(base, _) => base.references(pred),
            ConstExpr::IndexAddr(base, _) => base.references(pred),
            ConstExpr::Cast(base, _) => base.references(pred),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariableKind {
    Constant(ConstantValue),
    /// Procedure parameter by index.
    Param(u16),
    /// The SSA value defined by the instruction or φ-node with this id.
    Inst(InstId),
    /// The address of a module global; typed `Ptr(pointee)`.
    GlobalAddr(String),
    /// The address of a procedure.
    ProcAddr(String),
    ConstExpr(Box<ConstExpr>),
    Undef,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Variable {
    pub kind: VariableKind,
    pub ty: Type,
}

impl Variable {
    pub fn constant(value: ConstantValue) -> Self {
        Self {
            ty: value.ty(),
            kind: VariableKind::Constant(value),
        }
    }

    pub fn i32(value: i32) -> Self {
        Self::constant(ConstantValue::Int(value as i64, ElemType::I32))
    }

    pub fn u32(value: u32) -> Self {
        Self::constant(ConstantValue::UInt(value as u64, ElemType::U32))
    }

    pub fn u64(value: u64) -> Self {
        Self::constant(ConstantValue::UInt(value, ElemType::U64))
    }

    pub fn f32(value: f32) -> Self {
        Self::constant(ConstantValue::Float(FloatOrd(value as f64), ElemType::F32))
    }

    pub fn f64(value: f64) -> Self {
        Self::constant(ConstantValue::Float(FloatOrd(value), ElemType::F64))
    }

    pub fn bool(value: bool) -> Self {
        Self::constant(ConstantValue::Bool(value))
    }

    pub fn param(index: u16, ty: Type) -> Self {
        Self {
            kind: VariableKind::Param(index),
            ty,
        }
    }

    pub fn inst(id: InstId, ty: Type) -> Self {
        Self {
            kind: VariableKind::Inst(id),
            ty,
        }
    }

    pub fn global_addr(name: impl Into<String>, pointee: Type) -> Self {
        Self {
            kind: VariableKind::GlobalAddr(name.into()),
            ty: pointee.ptr_to(),
        }
    }

    pub fn proc_addr(name: impl Into<String>) -> Self {
        Self {
            kind: VariableKind::ProcAddr(name.into()),
            ty: Type::Scalar(ElemType::U8).ptr_to(),
        }
    }

    pub fn undef(ty: Type) -> Self {
        Self {
            kind: VariableKind::Undef,
            ty,
        }
    }

    pub fn as_inst(&self) -> Option<InstId> {
        match &self.kind {
            VariableKind::Inst(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<&ConstantValue> {
        match &self.kind {
            VariableKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_param(&self) -> Option<u16> {
        match &self.kind {
            VariableKind::Param(index) => Some(*index),
            _ => None,
        }
    }

    pub fn as_global(&self) -> Option<&str> {
        match &self.kind {
            VariableKind::GlobalAddr(name) => Some(name),
            _ => None,
        }
    }
}

impl Display for Variable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.kind {
            VariableKind::Constant(value) => match value {
                ConstantValue::Int(val, elem) => write!(f, "{val}{elem}"),
                ConstantValue::UInt(val, elem) => write!(f, "{val}{elem}"),
                ConstantValue::Float(val, elem) => write!(f, "{}{elem}", val.0),
                ConstantValue::Bool(val) => write!(f, "{val}"),
            },
            VariableKind::Param(index) => write!(f, "arg{index}"),
            VariableKind::Inst(id) => write!(f, "{id}"),
            VariableKind::GlobalAddr(name) => write!(f, "@{name}"),
            VariableKind::ProcAddr(name) => write!(f, "proc @{name}"),
            VariableKind::ConstExpr(expr) => write!(f, "constexpr({expr:?})"),
            VariableKind::Undef => write!(f, "undef"),
        }
    }
}
