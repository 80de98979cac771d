//! A reference interpreter for the IR. It exists for the test suites: the
//! end-to-end scenarios run the lowered module by calling the rewritten host
//! call sites and asserting on memory contents. The launch runtime entry
//! points are implemented as builtins; everything else must have a body.

use core::fmt::Display;

use hashbrown::HashMap;
use petgraph::graph::NodeIndex;

use crate::{
    ArithmeticOp, ComparisonOp, ConstantValue, ElemType, InstId, Module, Operation, Procedure,
    StructId, StructTable, Terminator, Type, Variable, VariableKind, symbols,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Int(i64, ElemType),
    UInt(u64, ElemType),
    Float(f64, ElemType),
    Bool(bool),
    Ptr(u64),
    Proc(String),
    Dim3(u32, u32, u32),
    Struct(Vec<Val>, StructId),
    Undef,
}

impl Val {
    fn as_u64(&self) -> Result<u64, InterpError> {
        match self {
            Val::Int(v, _) => Ok(*v as u64),
            Val::UInt(v, _) => Ok(*v),
            Val::Ptr(v) => Ok(*v),
            other => Err(InterpError::TypeMismatch(format!(
                "expected integer, got {other:?}"
            ))),
        }
    }

    fn as_i64(&self) -> Result<i64, InterpError> {
        match self {
            Val::Int(v, _) => Ok(*v),
            Val::UInt(v, _) => Ok(*v as i64),
            other => Err(InterpError::TypeMismatch(format!(
                "expected integer, got {other:?}"
            ))),
        }
    }

    fn as_ptr(&self) -> Result<u64, InterpError> {
        match self {
            Val::Ptr(v) => Ok(*v),
            other => Err(InterpError::TypeMismatch(format!(
                "expected pointer, got {other:?}"
            ))),
        }
    }

    fn as_dim3(&self) -> Result<(u32, u32, u32), InterpError> {
        match self {
            Val::Dim3(x, y, z) => Ok((*x, *y, *z)),
            other => Err(InterpError::TypeMismatch(format!(
                "expected dim3, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug)]
pub enum InterpError {
    UnknownCallee(String),
    CalleeIsDeclaration(String),
    UndefinedValue(InstId),
    UseOfUndef,
    TypeMismatch(String),
    BadAddress(u64),
    DoubleFree(u64),
    NoPhiEntry { block: usize },
    NoLaunchConfiguration,
    UnsupportedTerminator(String),
    ConstExprOperand,
    ArityMismatch(String),
}

impl Display for InterpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InterpError::UnknownCallee(name) => write!(f, "unknown callee @{name}"),
            InterpError::CalleeIsDeclaration(name) => {
                write!(f, "call to bodyless declaration @{name}")
            }
            InterpError::UndefinedValue(id) => write!(f, "read of undefined value {id}"),
            InterpError::UseOfUndef => write!(f, "arithmetic on undef"),
            InterpError::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            InterpError::BadAddress(addr) => write!(f, "bad address {addr:#x}"),
            InterpError::DoubleFree(addr) => write!(f, "free of dead allocation {addr:#x}"),
            InterpError::NoPhiEntry { block } => {
                write!(f, "phi has no entry for predecessor bb{block}")
            }
            InterpError::NoLaunchConfiguration => write!(f, "launch without pushed configuration"),
            InterpError::UnsupportedTerminator(msg) => {
                write!(f, "unsupported terminator: {msg}")
            }
            InterpError::ConstExprOperand => write!(f, "unflattened constant expression operand"),
            InterpError::ArityMismatch(name) => write!(f, "arity mismatch calling @{name}"),
        }
    }
}

impl std::error::Error for InterpError {}

/// Flat byte-addressed memory with a bump allocator. Every allocation is
/// tracked so tests can assert that the lowered code frees what it allocates.
#[derive(Default)]
pub struct Memory {
    data: Vec<u8>,
    live: HashMap<u64, u64>,
}

const NULL_GUARD: usize = 16;

impl Memory {
    fn ensure_guard(&mut self) {
        if self.data.is_empty() {
            self.data.resize(NULL_GUARD, 0);
        }
    }

    pub fn alloc(&mut self, size: u64) -> u64 {
        self.ensure_guard();
        let align = 16usize;
        let base = self.data.len().next_multiple_of(align);
        // Zero-sized allocations still get a unique base.
        self.data.resize(base + (size as usize).max(1), 0);
        self.live.insert(base as u64, size);
        base as u64
    }

    pub fn free(&mut self, base: u64) -> Result<(), InterpError> {
        match self.live.remove(&base) {
            Some(_) => Ok(()),
            None => Err(InterpError::DoubleFree(base)),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    fn check(&self, addr: u64, len: u64) -> Result<(), InterpError> {
        let end = addr.checked_add(len).ok_or(InterpError::BadAddress(addr))?;
        if addr < NULL_GUARD as u64 || end > self.data.len() as u64 {
            return Err(InterpError::BadAddress(addr));
        }
        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, len: u64) -> Result<&[u8], InterpError> {
        self.check(addr, len)?;
        Ok(&self.data[addr as usize..(addr + len) as usize])
    }

    pub fn write_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), InterpError> {
        self.check(addr, bytes.len() as u64)?;
        self.data[addr as usize..addr as usize + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_scalar(&self, addr: u64, elem: ElemType) -> Result<Val, InterpError> {
        let bytes = self.read_bytes(addr, elem.size_bytes() as u64)?;
        let val = match elem {
            ElemType::U8 => Val::UInt(bytes[0] as u64, elem),
            ElemType::Bool => Val::Bool(bytes[0] != 0),
            ElemType::I32 => Val::Int(
                i32::from_le_bytes(bytes.try_into().unwrap()) as i64,
                elem,
            ),
            ElemType::I64 => Val::Int(i64::from_le_bytes(bytes.try_into().unwrap()), elem),
            ElemType::U32 => Val::UInt(
                u32::from_le_bytes(bytes.try_into().unwrap()) as u64,
                elem,
            ),
            ElemType::U64 => Val::UInt(u64::from_le_bytes(bytes.try_into().unwrap()), elem),
            ElemType::F32 => Val::Float(
                f32::from_le_bytes(bytes.try_into().unwrap()) as f64,
                elem,
            ),
            ElemType::F64 => Val::Float(f64::from_le_bytes(bytes.try_into().unwrap()), elem),
        };
        Ok(val)
    }

    fn write_scalar(&mut self, addr: u64, val: &Val, elem: ElemType) -> Result<(), InterpError> {
        match elem {
            ElemType::U8 => self.write_bytes(addr, &[(val.as_u64()? & 0xff) as u8]),
            ElemType::Bool => {
                let v = matches!(val, Val::Bool(true)) as u8;
                self.write_bytes(addr, &[v])
            }
            ElemType::I32 => self.write_bytes(addr, &((val.as_i64()? as i32).to_le_bytes())),
            ElemType::I64 => self.write_bytes(addr, &val.as_i64()?.to_le_bytes()),
            ElemType::U32 => self.write_bytes(addr, &((val.as_u64()? as u32).to_le_bytes())),
            ElemType::U64 => self.write_bytes(addr, &val.as_u64()?.to_le_bytes()),
            ElemType::F32 => {
                let v = match val {
                    Val::Float(v, _) => *v as f32,
                    other => {
                        return Err(InterpError::TypeMismatch(format!(
                            "expected float, got {other:?}"
                        )));
                    }
                };
                self.write_bytes(addr, &v.to_le_bytes())
            }
            ElemType::F64 => {
                let v = match val {
                    Val::Float(v, _) => *v,
                    other => {
                        return Err(InterpError::TypeMismatch(format!(
                            "expected float, got {other:?}"
                        )));
                    }
                };
                self.write_bytes(addr, &v.to_le_bytes())
            }
        }
    }

    fn read_val(&self, addr: u64, ty: &Type, structs: &StructTable) -> Result<Val, InterpError> {
        match ty {
            Type::Scalar(elem) => self.read_scalar(addr, *elem),
            Type::Ptr(_) => {
                let bytes = self.read_bytes(addr, 8)?;
                Ok(Val::Ptr(u64::from_le_bytes(bytes.try_into().unwrap())))
            }
            Type::Dim3 => {
                let x = self.read_scalar(addr, ElemType::U32)?.as_u64()? as u32;
                let y = self.read_scalar(addr + 4, ElemType::U32)?.as_u64()? as u32;
                let z = self.read_scalar(addr + 8, ElemType::U32)?.as_u64()? as u32;
                Ok(Val::Dim3(x, y, z))
            }
            Type::Struct(id) => {
                let fields = structs.def(*id).fields.clone();
                let mut vals = Vec::with_capacity(fields.len());
                for (i, field_ty) in fields.iter().enumerate() {
                    let offset = structs.field_offset(*id, i as u32) as u64;
                    vals.push(self.read_val(addr + offset, field_ty, structs)?);
                }
                Ok(Val::Struct(vals, *id))
            }
            Type::Array(_, _) => Err(InterpError::TypeMismatch(
                "by-value array load".into(),
            )),
        }
    }

    fn write_val(
        &mut self,
        addr: u64,
        val: &Val,
        ty: &Type,
        structs: &StructTable,
    ) -> Result<(), InterpError> {
        match ty {
            Type::Scalar(elem) => self.write_scalar(addr, val, *elem),
            Type::Ptr(_) => self.write_bytes(addr, &val.as_ptr()?.to_le_bytes()),
            Type::Dim3 => {
                let (x, y, z) = val.as_dim3()?;
                self.write_bytes(addr, &x.to_le_bytes())?;
                self.write_bytes(addr + 4, &y.to_le_bytes())?;
                self.write_bytes(addr + 8, &z.to_le_bytes())
            }
            Type::Struct(id) => {
                let Val::Struct(vals, _) = val else {
                    return Err(InterpError::TypeMismatch(format!(
                        "expected struct, got {val:?}"
                    )));
                };
                let fields = structs.def(*id).fields.clone();
                for (i, field_ty) in fields.iter().enumerate() {
                    let offset = structs.field_offset(*id, i as u32) as u64;
                    self.write_val(addr + offset, &vals[i], field_ty, structs)?;
                }
                Ok(())
            }
            Type::Array(_, _) => Err(InterpError::TypeMismatch(
                "by-value array store".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LaunchConfig {
    grid_dim: (u32, u32, u32),
    block_dim: (u32, u32, u32),
    shared_mem: u64,
}

pub struct Interp<'m> {
    module: &'m Module,
    pub mem: Memory,
    configs: Vec<LaunchConfig>,
    global_addrs: HashMap<String, u64>,
}

struct Frame {
    args: Vec<Val>,
    values: HashMap<InstId, Val>,
    stack_allocs: Vec<u64>,
}

impl<'m> Interp<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            mem: Memory::default(),
            configs: Vec::new(),
            global_addrs: HashMap::new(),
        }
    }

    /// Allocate a raw buffer for test data; counts as a live allocation on
    /// both sides of a leak-freedom comparison.
    pub fn alloc_raw(&mut self, size: u64) -> u64 {
        self.mem.alloc(size)
    }

    pub fn write_f32s(&mut self, addr: u64, values: &[f32]) {
        for (i, v) in values.iter().enumerate() {
            self.mem
                .write_bytes(addr + 4 * i as u64, &v.to_le_bytes())
                .unwrap();
        }
    }

    pub fn read_f32s(&self, addr: u64, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let bytes = self.mem.read_bytes(addr + 4 * i as u64, 4).unwrap();
                f32::from_le_bytes(bytes.try_into().unwrap())
            })
            .collect()
    }

    pub fn write_u32s(&mut self, addr: u64, values: &[u32]) {
        for (i, v) in values.iter().enumerate() {
            self.mem
                .write_bytes(addr + 4 * i as u64, &v.to_le_bytes())
                .unwrap();
        }
    }

    pub fn read_u32s(&self, addr: u64, len: usize) -> Vec<u32> {
        (0..len)
            .map(|i| {
                let bytes = self.mem.read_bytes(addr + 4 * i as u64, 4).unwrap();
                u32::from_le_bytes(bytes.try_into().unwrap())
            })
            .collect()
    }

    pub fn live_allocations(&self) -> usize {
        self.mem.live_count()
    }

    /// Call a procedure or runtime builtin by name.
    pub fn call(&mut self, name: &str, args: Vec<Val>) -> Result<Option<Val>, InterpError> {
        match name {
            symbols::PUSH_CONFIGURATION => {
                if args.len() != 3 {
                    return Err(InterpError::ArityMismatch(name.into()));
                }
                self.configs.push(LaunchConfig {
                    grid_dim: args[0].as_dim3()?,
                    block_dim: args[1].as_dim3()?,
                    shared_mem: args[2].as_u64()?,
                });
                Ok(None)
            }
            symbols::LAUNCH_WITH_PUSHED => {
                let [target, kernel_args] = self.launch_args(name, args)?;
                let config = self.configs.pop().ok_or(InterpError::NoLaunchConfiguration)?;
                let Val::Proc(target) = target else {
                    return Err(InterpError::TypeMismatch("launch target".into()));
                };
                let (gx, gy, gz) = config.grid_dim;
                for bz in 0..gz {
                    for by in 0..gy {
                        for bx in 0..gx {
                            self.call(
                                &target,
                                vec![
                                    Val::Dim3(gx, gy, gz),
                                    Val::Dim3(bx, by, bz),
                                    Val::Dim3(
                                        config.block_dim.0,
                                        config.block_dim.1,
                                        config.block_dim.2,
                                    ),
                                    kernel_args.clone(),
                                    Val::UInt(config.shared_mem, ElemType::U64),
                                ],
                            )?;
                        }
                    }
                }
                Ok(None)
            }
            symbols::LAUNCH_SELF_CONTAINED_WITH_PUSHED => {
                let [target, kernel_args] = self.launch_args(name, args)?;
                let config = self.configs.pop().ok_or(InterpError::NoLaunchConfiguration)?;
                let Val::Proc(target) = target else {
                    return Err(InterpError::TypeMismatch("launch target".into()));
                };
                let (gx, gy, gz) = config.grid_dim;
                let (bx, by, bz) = config.block_dim;
                self.call(
                    &target,
                    vec![
                        Val::Dim3(gx, gy, gz),
                        Val::Dim3(bx, by, bz),
                        kernel_args,
                        Val::UInt(config.shared_mem, ElemType::U64),
                    ],
                )?;
                Ok(None)
            }
            _ => {
                let proc = self
                    .module
                    .proc(name)
                    .ok_or_else(|| InterpError::UnknownCallee(name.into()))?;
                if proc.declaration {
                    return Err(InterpError::CalleeIsDeclaration(name.into()));
                }
                if proc.params.len() != args.len() {
                    return Err(InterpError::ArityMismatch(name.into()));
                }
                let proc = proc.clone();
                self.run(&proc, args)
            }
        }
    }

    fn launch_args(&self, name: &str, args: Vec<Val>) -> Result<[Val; 2], InterpError> {
        let [target, kernel_args]: [Val; 2] = args
            .try_into()
            .map_err(|_| InterpError::ArityMismatch(name.into()))?;
        Ok([target, kernel_args])
    }

    fn global_addr(&mut self, name: &str) -> Result<u64, InterpError> {
        if let Some(addr) = self.global_addrs.get(name) {
            return Ok(*addr);
        }
        let global = self
            .module
            .global(name)
            .ok_or_else(|| InterpError::UnknownCallee(name.into()))?;
        let size = global.ty.size_bytes(&self.module.structs) as u64;
        let addr = self.mem.alloc(size);
        self.global_addrs.insert(name.into(), addr);
        Ok(addr)
    }

    fn eval(&mut self, frame: &Frame, var: &Variable) -> Result<Val, InterpError> {
        match &var.kind {
            VariableKind::Constant(value) => Ok(match value {
                ConstantValue::Int(v, elem) => Val::Int(*v, *elem),
                ConstantValue::UInt(v, elem) => Val::UInt(*v, *elem),
                ConstantValue::Float(v, elem) => Val::Float(v.0, *elem),
                ConstantValue::Bool(v) => Val::Bool(*v),
            }),
            VariableKind::Param(index) => Ok(frame.args[*index as usize].clone()),
            VariableKind::Inst(id) => frame
                .values
                .get(id)
                .cloned()
                .ok_or(InterpError::UndefinedValue(*id)),
            VariableKind::GlobalAddr(name) => Ok(Val::Ptr(self.global_addr(name)?)),
            VariableKind::ProcAddr(name) => Ok(Val::Proc(name.clone())),
            VariableKind::ConstExpr(_) => Err(InterpError::ConstExprOperand),
            VariableKind::Undef => Ok(Val::Undef),
        }
    }

    fn run(&mut self, proc: &Procedure, args: Vec<Val>) -> Result<Option<Val>, InterpError> {
        let mut frame = Frame {
            args,
            values: HashMap::new(),
            stack_allocs: Vec::new(),
        };
        let mut current = proc.entry;
        let mut prev: Option<NodeIndex> = None;

        let result = loop {
            let bb = proc.block(current);

            if !bb.phi_nodes.is_empty() {
                let prev = prev.ok_or(InterpError::NoPhiEntry {
                    block: current.index(),
                })?;
                let mut incoming = Vec::with_capacity(bb.phi_nodes.len());
                for phi in &bb.phi_nodes {
                    let entry = phi
                        .entries
                        .iter()
                        .find(|entry| entry.block == prev)
                        .ok_or(InterpError::NoPhiEntry {
                            block: current.index(),
                        })?;
                    let id = phi.out.as_inst().expect("phi out is an inst");
                    incoming.push((id, self.eval(&frame, &entry.value)?));
                }
                for (id, val) in incoming {
                    frame.values.insert(id, val);
                }
            }

            for (_, inst) in bb.ops_in_order() {
                self.exec(&mut frame, inst.id, &inst.operation, &inst.out_ty)?;
            }

            match &bb.terminator {
                Terminator::Branch { target } => {
                    prev = Some(current);
                    current = *target;
                }
                Terminator::CondBranch {
                    cond,
                    then_target,
                    else_target,
                } => {
                    let cond = match self.eval(&frame, cond)? {
                        Val::Bool(v) => v,
                        other => {
                            return Err(InterpError::TypeMismatch(format!(
                                "branch condition {other:?}"
                            )));
                        }
                    };
                    prev = Some(current);
                    current = if cond { *then_target } else { *else_target };
                }
                Terminator::Switch {
                    value,
                    default,
                    cases,
                } => {
                    let value = self.eval(&frame, value)?.as_i64()?;
                    let target = cases
                        .iter()
                        .find(|(case, _)| *case == value)
                        .map(|(_, target)| *target)
                        .unwrap_or(*default);
                    prev = Some(current);
                    current = target;
                }
                Terminator::Return { value } => {
                    let value = match value {
                        Some(value) => Some(self.eval(&frame, value)?),
                        None => None,
                    };
                    break value;
                }
                other => {
                    return Err(InterpError::UnsupportedTerminator(format!("{other:?}")));
                }
            }
        };

        for addr in frame.stack_allocs {
            self.mem.free(addr)?;
        }
        Ok(result)
    }

    fn exec(
        &mut self,
        frame: &mut Frame,
        id: InstId,
        operation: &Operation,
        out_ty: &Option<Type>,
    ) -> Result<(), InterpError> {
        let out = match operation {
            Operation::Arithmetic(op, bin) => {
                let lhs = self.eval(frame, &bin.lhs)?;
                let rhs = self.eval(frame, &bin.rhs)?;
                Some(arith(*op, &lhs, &rhs)?)
            }
            Operation::Comparison(op, bin) => {
                let lhs = self.eval(frame, &bin.lhs)?;
                let rhs = self.eval(frame, &bin.rhs)?;
                Some(Val::Bool(compare(*op, &lhs, &rhs)?))
            }
            Operation::Copy(value) => Some(self.eval(frame, value)?),
            Operation::Cast { value, to } => {
                let value = self.eval(frame, value)?;
                Some(cast(&value, to)?)
            }
            Operation::Load { addr } => {
                let addr = self.eval(frame, addr)?.as_ptr()?;
                let ty = out_ty.as_ref().expect("load has a result type");
                Some(self.mem.read_val(addr, ty, &self.module.structs)?)
            }
            Operation::Store { addr, value } => {
                let dest = self.eval(frame, addr)?.as_ptr()?;
                let val = self.eval(frame, value)?;
                self.mem.write_val(dest, &val, &value.ty, &self.module.structs)?;
                None
            }
            Operation::FieldAddr { base, field } => {
                let addr = self.eval(frame, base)?.as_ptr()?;
                let offset = match base.ty.pointee() {
                    Some(Type::Struct(id)) => self.module.structs.field_offset(*id, *field),
                    Some(Type::Dim3) => field * 4,
                    other => {
                        return Err(InterpError::TypeMismatch(format!(
                            "field_addr through {other:?}"
                        )));
                    }
                };
                Some(Val::Ptr(addr + offset as u64))
            }
            Operation::IndexAddr { base, index } => {
                let addr = self.eval(frame, base)?.as_ptr()?;
                let index = self.eval(frame, index)?.as_u64()?;
                let step = match base.ty.pointee() {
                    Some(Type::Array(elem, _)) => elem.size_bytes(&self.module.structs),
                    Some(pointee) => pointee.size_bytes(&self.module.structs),
                    None => {
                        return Err(InterpError::TypeMismatch(
                            "index_addr through non-pointer".into(),
                        ));
                    }
                };
                Some(Val::Ptr(addr + index * step as u64))
            }
            Operation::Extract { base, field } => {
                let base = self.eval(frame, base)?;
                let val = match base {
                    Val::Dim3(x, y, z) => {
                        Val::UInt([x, y, z][*field as usize] as u64, ElemType::U32)
                    }
                    Val::Struct(fields, _) => fields[*field as usize].clone(),
                    Val::Undef => return Err(InterpError::UseOfUndef),
                    other => {
                        return Err(InterpError::TypeMismatch(format!(
                            "extract from {other:?}"
                        )));
                    }
                };
                Some(val)
            }
            Operation::MakeStruct { fields } => {
                let vals = fields
                    .iter()
                    .map(|field| self.eval(frame, field))
                    .collect::<Result<Vec<_>, _>>()?;
                match out_ty {
                    Some(Type::Dim3) => {
                        let x = vals[0].as_u64()? as u32;
                        let y = vals[1].as_u64()? as u32;
                        let z = vals[2].as_u64()? as u32;
                        Some(Val::Dim3(x, y, z))
                    }
                    Some(Type::Struct(id)) => Some(Val::Struct(vals, *id)),
                    other => {
                        return Err(InterpError::TypeMismatch(format!(
                            "make_struct of {other:?}"
                        )));
                    }
                }
            }
            Operation::StackAlloc { elem, count } | Operation::HeapAlloc { elem, count } => {
                let count = self.eval(frame, count)?.as_u64()?;
                let size = count * elem.size_bytes(&self.module.structs) as u64;
                let addr = self.mem.alloc(size);
                if matches!(operation, Operation::StackAlloc { .. }) {
                    frame.stack_allocs.push(addr);
                }
                Some(Val::Ptr(addr))
            }
            Operation::HeapFree { ptr } => {
                let addr = self.eval(frame, ptr)?.as_ptr()?;
                self.mem.free(addr)?;
                None
            }
            Operation::LifetimeStart { .. } | Operation::LifetimeEnd { .. } => None,
            Operation::Call { callee, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(frame, arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(callee, args)?
            }
        };
        if let Some(out) = out {
            frame.values.insert(id, out);
        }
        Ok(())
    }
}

fn truncate_int(v: i64, elem: ElemType) -> i64 {
    match elem {
        ElemType::I32 => v as i32 as i64,
        _ => v,
    }
}

fn truncate_uint(v: u64, elem: ElemType) -> u64 {
    match elem {
        ElemType::U8 => v as u8 as u64,
        ElemType::U32 => v as u32 as u64,
        _ => v,
    }
}

fn arith(op: ArithmeticOp, lhs: &Val, rhs: &Val) -> Result<Val, InterpError> {
    let val = match (lhs, rhs) {
        (Val::Int(a, elem), Val::Int(b, _)) => {
            let v = match op {
                ArithmeticOp::Add => a.wrapping_add(*b),
                ArithmeticOp::Sub => a.wrapping_sub(*b),
                ArithmeticOp::Mul => a.wrapping_mul(*b),
                ArithmeticOp::Div => a.wrapping_div(*b),
                ArithmeticOp::Rem => a.wrapping_rem(*b),
            };
            Val::Int(truncate_int(v, *elem), *elem)
        }
        (Val::UInt(a, elem), Val::UInt(b, _)) => {
            let v = match op {
                ArithmeticOp::Add => a.wrapping_add(*b),
                ArithmeticOp::Sub => a.wrapping_sub(*b),
                ArithmeticOp::Mul => a.wrapping_mul(*b),
                ArithmeticOp::Div => a / b,
                ArithmeticOp::Rem => a % b,
            };
            Val::UInt(truncate_uint(v, *elem), *elem)
        }
        (Val::Float(a, elem), Val::Float(b, _)) => {
            let v = match op {
                ArithmeticOp::Add => a + b,
                ArithmeticOp::Sub => a - b,
                ArithmeticOp::Mul => a * b,
                ArithmeticOp::Div => a / b,
                ArithmeticOp::Rem => a % b,
            };
            let v = if *elem == ElemType::F32 { v as f32 as f64 } else { v };
            Val::Float(v, *elem)
        }
        (Val::Undef, _) | (_, Val::Undef) => return Err(InterpError::UseOfUndef),
        (a, b) => {
            return Err(InterpError::TypeMismatch(format!(
                "arithmetic on {a:?} and {b:?}"
            )));
        }
    };
    Ok(val)
}

fn compare(op: ComparisonOp, lhs: &Val, rhs: &Val) -> Result<bool, InterpError> {
    fn decide<T: PartialOrd>(op: ComparisonOp, a: T, b: T) -> bool {
        match op {
            ComparisonOp::Equal => a == b,
            ComparisonOp::NotEqual => a != b,
            ComparisonOp::Lower => a < b,
            ComparisonOp::LowerEqual => a <= b,
            ComparisonOp::Greater => a > b,
            ComparisonOp::GreaterEqual => a >= b,
        }
    }
    match (lhs, rhs) {
        (Val::Int(a, _), Val::Int(b, _)) => Ok(decide(op, *a, *b)),
        (Val::UInt(a, _), Val::UInt(b, _)) => Ok(decide(op, *a, *b)),
        (Val::Float(a, _), Val::Float(b, _)) => Ok(decide(op, *a, *b)),
        (Val::Bool(a), Val::Bool(b)) => Ok(decide(op, *a, *b)),
        (Val::Ptr(a), Val::Ptr(b)) => Ok(decide(op, *a, *b)),
        (Val::Undef, _) | (_, Val::Undef) => Err(InterpError::UseOfUndef),
        (a, b) => Err(InterpError::TypeMismatch(format!(
            "comparison of {a:?} and {b:?}"
        ))),
    }
}

fn cast(value: &Val, to: &Type) -> Result<Val, InterpError> {
    let val = match to {
        Type::Ptr(_) => match value {
            Val::Ptr(v) => Val::Ptr(*v),
            Val::Proc(name) => Val::Proc(name.clone()),
            Val::UInt(v, _) => Val::Ptr(*v),
            other => {
                return Err(InterpError::TypeMismatch(format!(
                    "cast {other:?} to pointer"
                )));
            }
        },
        Type::Scalar(elem) if elem.is_float() => match value {
            Val::Int(v, _) => Val::Float(*v as f64, *elem),
            Val::UInt(v, _) => Val::Float(*v as f64, *elem),
            Val::Float(v, _) => {
                let v = if *elem == ElemType::F32 { *v as f32 as f64 } else { *v };
                Val::Float(v, *elem)
            }
            other => {
                return Err(InterpError::TypeMismatch(format!(
                    "cast {other:?} to float"
                )));
            }
        },
        Type::Scalar(elem) if elem.is_signed_int() => match value {
            Val::Int(v, _) => Val::Int(truncate_int(*v, *elem), *elem),
            Val::UInt(v, _) => Val::Int(truncate_int(*v as i64, *elem), *elem),
            Val::Float(v, _) => Val::Int(truncate_int(*v as i64, *elem), *elem),
            Val::Bool(v) => Val::Int(*v as i64, *elem),
            other => {
                return Err(InterpError::TypeMismatch(format!(
                    "cast {other:?} to int"
                )));
            }
        },
        Type::Scalar(elem) if elem.is_unsigned_int() => match value {
            Val::Int(v, _) => Val::UInt(truncate_uint(*v as u64, *elem), *elem),
            Val::UInt(v, _) => Val::UInt(truncate_uint(*v, *elem), *elem),
            Val::Float(v, _) => Val::UInt(truncate_uint(*v as u64, *elem), *elem),
            Val::Bool(v) => Val::UInt(*v as u64, *elem),
            Val::Ptr(v) => Val::UInt(truncate_uint(*v, *elem), *elem),
            other => {
                return Err(InterpError::TypeMismatch(format!(
                    "cast {other:?} to uint"
                )));
            }
        },
        other => {
            return Err(InterpError::TypeMismatch(format!(
                "unsupported cast target {other:?}"
            )));
        }
    };
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArithmeticOp, ComparisonOp, Param, ProcBuilder, Variable};

    #[test]
    fn memory_scalar_roundtrip() {
        let module = Module::default();
        let mut interp = Interp::new(&module);
        let addr = interp.alloc_raw(16);
        interp.write_f32s(addr, &[1.5, -2.25]);
        assert_eq!(interp.read_f32s(addr, 2), vec![1.5, -2.25]);
        interp.write_u32s(addr + 8, &[7]);
        assert_eq!(interp.read_u32s(addr + 8, 1), vec![7]);
    }

    #[test]
    fn phi_loop_sums() {
        // sum of 0..n via a header φ pair.
        let mut b = ProcBuilder::new(
            "sum_below",
            vec![Param::new("n", Type::Scalar(ElemType::U32))],
            Some(Type::Scalar(ElemType::U32)),
        );
        let entry = b.entry();
        let hdr = b.create_block();
        let body = b.create_block();
        let done = b.create_block();
        b.branch(hdr);
        let i = b.phi(hdr, Type::Scalar(ElemType::U32), vec![(entry, Variable::u32(0))]);
        let acc = b.phi(hdr, Type::Scalar(ElemType::U32), vec![(entry, Variable::u32(0))]);
        b.switch_to(hdr);
        let n = b.param(0);
        let at_end = b.cmp(ComparisonOp::Equal, i.clone(), n);
        b.cond_branch(at_end, done, body);
        b.switch_to(body);
        let acc2 = b.arith(ArithmeticOp::Add, acc.clone(), i.clone());
        let i2 = b.arith(ArithmeticOp::Add, i.clone(), Variable::u32(1));
        b.branch(hdr);
        {
            let phis = &mut b.proc_mut().block_mut(hdr).phi_nodes;
            phis[0].entries.push(crate::PhiEntry { block: body, value: i2 });
            phis[1].entries.push(crate::PhiEntry { block: body, value: acc2 });
        }
        b.switch_to(done);
        b.ret(Some(acc));

        let mut module = Module::default();
        module.add_proc(b.finish());
        let mut interp = Interp::new(&module);
        let result = interp
            .call("sum_below", vec![Val::UInt(5, ElemType::U32)])
            .unwrap();
        assert_eq!(result, Some(Val::UInt(10, ElemType::U32)));
    }

    #[test]
    fn launch_builtin_iterates_the_grid() {
        // A wrapper-shaped procedure that records its block index.
        let byte_ptr = Type::Scalar(ElemType::U8).ptr_to();
        let mut b = ProcBuilder::new(
            "record_block",
            vec![
                Param::new("grid_dim", Type::Dim3),
                Param::new("block_idx", Type::Dim3),
                Param::new("block_dim", Type::Dim3),
                Param::new("args", byte_ptr.clone().ptr_to()),
                Param::new("shared_mem_size", Type::Scalar(ElemType::U64)),
            ],
            None,
        );
        let args = b.param(3);
        let slot0 = b.index_addr(args, Variable::u32(0));
        let raw = b.load(slot0);
        let out = b.cast(raw, Type::Scalar(ElemType::U32).ptr_to());
        let block_idx = b.param(1);
        let bx = b.extract(block_idx, 0, Type::Scalar(ElemType::U32));
        let cell = b.index_addr(out.clone(), bx.clone());
        b.store(cell, bx);
        b.ret(None);

        let mut module = Module::default();
        module.add_proc(b.finish());

        let mut interp = Interp::new(&module);
        let out_buf = interp.alloc_raw(4 * 3);
        let arg_table = interp.alloc_raw(8);
        interp.mem.write_bytes(arg_table, &out_buf.to_le_bytes()).unwrap();

        interp
            .call(
                symbols::PUSH_CONFIGURATION,
                vec![Val::Dim3(3, 1, 1), Val::Dim3(1, 1, 1), Val::UInt(0, ElemType::U64)],
            )
            .unwrap();
        interp
            .call(
                symbols::LAUNCH_WITH_PUSHED,
                vec![Val::Proc("record_block".into()), Val::Ptr(arg_table)],
            )
            .unwrap();
        assert_eq!(interp.read_u32s(out_buf, 3), vec![0, 1, 2]);
    }
}
