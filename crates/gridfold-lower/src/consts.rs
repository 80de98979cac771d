//! Constant-expression flattening. Later stages rewrite shared-global uses
//! and repair φ operands under the assumption that every use is an ordinary
//! instruction operand; a constant expression embedding a shared global (or
//! a kernel's address) would dodge those rewrites. Before anything else runs,
//! each such expression is rebuilt as instructions at the entry of the using
//! procedure. The orphaned constant trees simply drop out of existence.

use hashbrown::{HashMap, HashSet};
use gridfold_ir::{
    ConstExpr, Instruction, Module, Operation, Procedure, Type, Variable, VariableKind,
};

use crate::error::{LowerError, Result};

/// Flatten every constant expression that transitively depends on a shared
/// global or on a kernel entry, in every procedure of the module.
pub fn flatten(module: &mut Module) -> Result<()> {
    let shared: HashSet<String> = module
        .globals
        .iter()
        .filter(|global| global.shared.is_some())
        .map(|global| global.name.clone())
        .collect();
    let kernels: HashSet<String> = module.kernel_entries().into_iter().collect();

    let proc_names: Vec<String> = module
        .procedures
        .iter()
        .filter(|proc| !proc.declaration)
        .map(|proc| proc.name.clone())
        .collect();
    for name in proc_names {
        let mut proc = module.remove_proc(&name).expect("scanned above");
        let result = flatten_proc(module, &mut proc, &shared, &kernels);
        module.add_proc(proc);
        result?;
    }
    Ok(())
}

fn interesting(expr: &ConstExpr, shared: &HashSet<String>, kernels: &HashSet<String>) -> bool {
    expr.references(&mut |name, is_proc| {
        if is_proc {
            kernels.contains(name)
        } else {
            shared.contains(name)
        }
    })
}

fn flatten_proc(
    module: &Module,
    proc: &mut Procedure,
    shared: &HashSet<String>,
    kernels: &HashSet<String>,
) -> Result<()> {
    // Collect the expressions first; all materialised instructions go to the
    // procedure entry, deduplicated per expression.
    let mut todo: Vec<ConstExpr> = Vec::new();
    proc.visit_operands(|var| {
        if let VariableKind::ConstExpr(expr) = &var.kind
            && interesting(expr, shared, kernels)
            && !todo.contains(expr)
        {
            todo.push((**expr).clone());
        }
    });
    if todo.is_empty() {
        return Ok(());
    }

    let mut materialised: HashMap<ConstExpr, Variable> = HashMap::new();
    let mut new_ops: Vec<Instruction> = Vec::new();
    for expr in &todo {
        materialise(module, proc, expr, &mut materialised, &mut new_ops)?;
    }

    // Prepend to the entry, then rewrite the operands.
    let existing: Vec<Instruction> = proc
        .block(proc.entry)
        .ops_in_order()
        .map(|(_, inst)| inst.clone())
        .collect();
    new_ops.extend(existing);
    let entry = proc.entry;
    proc.rebuild_ops(entry, new_ops);

    proc.visit_operands(|var| {
        let new = match &var.kind {
            VariableKind::ConstExpr(expr) => materialised.get(expr.as_ref()).cloned(),
            _ => None,
        };
        if let Some(new) = new {
            *var = new;
        }
    });
    Ok(())
}

/// Rebuild one constant expression as entry instructions, reusing already
/// materialised subtrees. Roots stay plain operands; only expression nodes
/// become instructions.
fn materialise(
    module: &Module,
    proc: &mut Procedure,
    expr: &ConstExpr,
    materialised: &mut HashMap<ConstExpr, Variable>,
    new_ops: &mut Vec<Instruction>,
) -> Result<Variable> {
    if let Some(existing) = materialised.get(expr) {
        return Ok(existing.clone());
    }
    let var = match expr {
        ConstExpr::GlobalAddr(name) => {
            let global = module.global(name).ok_or_else(|| unhandled(expr, "unknown global"))?;
            Variable::global_addr(name.clone(), global.ty.clone())
        }
        ConstExpr::ProcAddr(name) => Variable::proc_addr(name.clone()),
        ConstExpr::FieldAddr(base, field) => {
            let base = materialise(module, proc, base, materialised, new_ops)?;
            let pointee = base
                .ty
                .pointee()
                .ok_or_else(|| unhandled(expr, "field of a non-pointer"))?;
            let field_ty = module
                .structs
                .field_ty_of(pointee, *field)
                .ok_or_else(|| unhandled(expr, "field of a non-aggregate"))?;
            emit(
                proc,
                new_ops,
                Operation::FieldAddr {
                    base,
                    field: *field,
                },
                field_ty.ptr_to(),
            )
        }
        ConstExpr::IndexAddr(base, index) => {
            let base = materialise(module, proc, base, materialised, new_ops)?;
            let out_ty = match base.ty.pointee() {
                Some(Type::Array(elem, _)) => Type::Ptr(elem.clone()),
                Some(_) => base.ty.clone(),
                None => return Err(unhandled(expr, "indexing through a non-pointer")),
            };
            emit(
                proc,
                new_ops,
                Operation::IndexAddr {
                    base,
                    index: Variable::u64(*index as u64),
                },
                out_ty,
            )
        }
        ConstExpr::Cast(base, to) => {
            let base = materialise(module, proc, base, materialised, new_ops)?;
            emit(
                proc,
                new_ops,
                Operation::Cast {
                    value: base,
                    to: to.clone(),
                },
                to.clone(),
            )
        }
    };
    materialised.insert(expr.clone(), var.clone());
    Ok(var)
}

fn emit(
    proc: &mut Procedure,
    new_ops: &mut Vec<Instruction>,
    operation: Operation,
    out_ty: Type,
) -> Variable {
    let id = proc.new_inst_id();
    new_ops.push(Instruction::new(id, operation, Some(out_ty.clone())));
    Variable::inst(id, out_ty)
}

fn unhandled(expr: &ConstExpr, detail: &str) -> LowerError {
    let mut root = String::new();
    expr.references(&mut |name, _| {
        if root.is_empty() {
            root = name.to_string();
        }
        true
    });
    LowerError::UnhandledConstExpr {
        symbol: root,
        detail: detail.to_string(),
    }
}
