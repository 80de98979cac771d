//! The runtime support symbols of the input contract: dim-query and barrier
//! intrinsic declarations, the dim helper templates whose bodies the pass
//! clones, and the launch entry point declarations. A frontend would install
//! these from its companion header; [`declare_support`] installs them for
//! embedders and tests. The pass itself only looks symbols up by name.

use gridfold_ir::{
    ElemType, Module, Operation, Param, ProcBuilder, Procedure, Type, symbols,
};

use crate::error::{LowerError, Result};

fn u32_ty() -> Type {
    Type::Scalar(ElemType::U32)
}

/// Install every support symbol that is not already present.
pub fn declare_support(module: &mut Module) {
    for triple in symbols::DimTriple::ALL {
        for axis in symbols::Axis::ALL {
            let name = symbols::dim_query_name(triple, axis);
            if module.proc(name).is_none() {
                let mut decl = Procedure::declaration(name, vec![], Some(u32_ty()));
                decl.pure = true;
                module.add_proc(decl);
            }
        }
    }
    if module.proc(symbols::BARRIER).is_none() {
        module.add_proc(Procedure::declaration(symbols::BARRIER, vec![], None));
    }

    if module.proc(symbols::CONSTRUCT_DIM3).is_none() {
        let mut builder = ProcBuilder::new(
            symbols::CONSTRUCT_DIM3,
            vec![
                Param::new("x", u32_ty()),
                Param::new("y", u32_ty()),
                Param::new("z", u32_ty()),
            ],
            Some(Type::Dim3),
        );
        let fields = vec![builder.param(0), builder.param(1), builder.param(2)];
        let dim = builder.make_struct(fields, Type::Dim3);
        builder.ret(Some(dim));
        let mut proc = builder.finish();
        proc.pure = true;
        module.add_proc(proc);
    }

    for (axis, name) in symbols::DIM3_GET.iter().enumerate() {
        if module.proc(name).is_none() {
            let mut builder =
                ProcBuilder::new(*name, vec![Param::new("d", Type::Dim3)], Some(u32_ty()));
            let base = builder.param(0);
            let value = builder.extract(base, axis as u32, u32_ty());
            builder.ret(Some(value));
            let mut proc = builder.finish();
            proc.pure = true;
            module.add_proc(proc);
        }
    }

    let byte_ptr = Type::Scalar(ElemType::U8).ptr_to();
    let arg_array = byte_ptr.clone().ptr_to();
    if module.proc(symbols::PUSH_CONFIGURATION).is_none() {
        module.add_proc(Procedure::declaration(
            symbols::PUSH_CONFIGURATION,
            vec![
                Param::new("grid_dim", Type::Dim3),
                Param::new("block_dim", Type::Dim3),
                Param::new("shared_mem", Type::Scalar(ElemType::U64)),
            ],
            None,
        ));
    }
    for launch in [
        symbols::LAUNCH_WITH_PUSHED,
        symbols::LAUNCH_SELF_CONTAINED_WITH_PUSHED,
    ] {
        if module.proc(launch).is_none() {
            module.add_proc(Procedure::declaration(
                launch,
                vec![
                    Param::new("kernel", byte_ptr.clone()),
                    Param::new("args", arg_array.clone()),
                ],
                None,
            ));
        }
    }
}

/// Look up a support procedure, failing with the missing name.
pub fn expect_proc<'m>(module: &'m Module, name: &str) -> Result<&'m Procedure> {
    module.proc(name).ok_or_else(|| LowerError::MissingSupportSymbol {
        name: name.to_string(),
    })
}

/// Whether a call is the synchronisation barrier.
pub fn is_barrier(operation: &Operation) -> bool {
    matches!(operation, Operation::Call { callee, .. } if callee == symbols::BARRIER)
}

/// Remove the intrinsic declarations and helper templates once every kernel
/// has been lowered. The launch entries stay: rewritten call sites target
/// them.
pub fn erase_support(module: &mut Module) {
    for triple in symbols::DimTriple::ALL {
        for axis in symbols::Axis::ALL {
            module.remove_proc(symbols::dim_query_name(triple, axis));
        }
    }
    module.remove_proc(symbols::BARRIER);
    module.remove_proc(symbols::CONSTRUCT_DIM3);
    for name in symbols::DIM3_GET {
        module.remove_proc(name);
    }
}
