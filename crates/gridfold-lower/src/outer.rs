//! The two outer procedures exposed to the host runtime, and the rewriting
//! of launch call sites. The wrapper consumes a pre-pushed launch
//! configuration and runs one block; the self-contained variant additionally
//! iterates every block of the grid. Exactly one of them later takes the
//! kernel's original name.

use gridfold_ir::{
    ElemType, Instruction, Module, Operation, Param, PTR_SIZE, ProcBuilder, Procedure, Type,
    Variable, symbols,
};

use crate::driver::{CountedLoop, construct_dim3, dim_axis, driver_name};
use crate::error::Result;
use crate::Options;

fn byte_ptr() -> Type {
    Type::Scalar(ElemType::U8).ptr_to()
}

fn arg_array_ty() -> Type {
    byte_ptr().ptr_to()
}

pub fn wrapper_name(original: &str) -> String {
    format!("{original}.wrapper")
}

pub fn self_contained_name(original: &str) -> String {
    format!("{original}.self_contained")
}

/// Unpack the original arguments from the launch argument array: each slot
/// holds a pointer to a stored argument value.
fn unpack_args(
    builder: &mut ProcBuilder,
    args_param: Variable,
    original_params: &[Param],
) -> Vec<Variable> {
    let mut unpacked = Vec::with_capacity(original_params.len());
    for (index, param) in original_params.iter().enumerate() {
        let slot = builder.index_addr(args_param.clone(), Variable::u32(index as u32));
        let raw = builder.load(slot);
        let typed = builder.cast(raw, param.ty.clone().ptr_to());
        unpacked.push(builder.load(typed));
    }
    unpacked
}

/// Wrapper: `(grid_dim, block_idx, block_dim, args, shared_mem_size)`; the
/// host runtime iterates blocks.
pub fn build_wrapper(
    module: &mut Module,
    original_name: &str,
    original_params: &[Param],
) -> Result<String> {
    let params = vec![
        Param::new("grid_dim", Type::Dim3),
        Param::new("block_idx", Type::Dim3),
        Param::new("block_dim", Type::Dim3),
        Param::new("args", arg_array_ty()),
        Param::new("shared_mem_size", Type::Scalar(ElemType::U64)),
    ];
    let mut builder = ProcBuilder::new(wrapper_name(original_name), params, None);

    let args_param = builder.param(3);
    let mut call_args = unpack_args(&mut builder, args_param, original_params);
    call_args.push(builder.param(0));
    call_args.push(builder.param(1));
    call_args.push(builder.param(2));
    call_args.push(builder.param(4));
    builder.call(driver_name(original_name), call_args, None);
    builder.ret(None);

    let proc = builder.finish();
    let name = proc.name.clone();
    module.add_proc(proc);
    Ok(name)
}

/// Self-contained variant: `(grid_dim, block_dim, args, shared_mem_size)`;
/// iterates the whole grid internally, calling the driver once per block.
pub fn build_self_contained(
    module: &mut Module,
    original_name: &str,
    original_params: &[Param],
) -> Result<String> {
    let params = vec![
        Param::new("grid_dim", Type::Dim3),
        Param::new("block_dim", Type::Dim3),
        Param::new("args", arg_array_ty()),
        Param::new("shared_mem_size", Type::Scalar(ElemType::U64)),
    ];
    let mut builder = ProcBuilder::new(self_contained_name(original_name), params, None);
    let entry = builder.entry();

    let args_param = builder.param(2);
    let unpacked = unpack_args(&mut builder, args_param, original_params);
    let grid_dim = builder.param(0);
    let grid_x = dim_axis(&mut builder, module, grid_dim.clone(), 0)?;
    let grid_y = dim_axis(&mut builder, module, grid_dim.clone(), 1)?;
    let grid_z = dim_axis(&mut builder, module, grid_dim, 2)?;

    let loop_z = CountedLoop::build(&mut builder, grid_z, entry);
    let loop_y = CountedLoop::build(&mut builder, grid_y, entry);
    let loop_x = CountedLoop::build(&mut builder, grid_x, entry);
    loop_z.hook_up(&mut builder, loop_y.head, loop_y.end);
    loop_y.hook_up(&mut builder, loop_x.head, loop_x.end);

    let body = builder.create_block();
    builder.switch_to(body);
    let block_idx = construct_dim3(
        &mut builder,
        module,
        loop_x.idx.clone(),
        loop_y.idx.clone(),
        loop_z.idx.clone(),
    )?;
    let mut call_args = unpacked;
    call_args.push(builder.param(0));
    call_args.push(block_idx);
    call_args.push(builder.param(1));
    call_args.push(builder.param(3));
    builder.call(driver_name(original_name), call_args, None);
    loop_x.hook_up(&mut builder, body, body);

    let exit = builder.create_block();
    builder.switch_to(entry);
    builder.branch(loop_z.head);
    builder.switch_to(loop_z.end);
    builder.branch(exit);
    builder.switch_to(exit);
    builder.ret(None);

    let proc = builder.finish();
    let name = proc.name.clone();
    module.add_proc(proc);
    Ok(name)
}

/// Rewrite every direct call of the kernel into a heap-allocated argument
/// array plus a call to the configured launch entry point, then free the
/// array. Push-configuration calls around the site are left in place; uses
/// of the kernel's address that are not calls are left alone.
pub fn rewrite_call_sites(module: &mut Module, original_name: &str, options: &Options) {
    let launch_entry = if options.use_self_contained_kernel {
        symbols::LAUNCH_SELF_CONTAINED_WITH_PUSHED
    } else {
        symbols::LAUNCH_WITH_PUSHED
    };

    let proc_names: Vec<String> = module.procedures.iter().map(|p| p.name.clone()).collect();
    for proc_name in proc_names {
        loop {
            let Some(site) = find_call_site(module, &proc_name, original_name) else {
                break;
            };
            let (block, idx) = site;
            let structs = module.structs.clone();
            let proc = module.proc_mut(&proc_name).expect("scanned above");
            let Operation::Call { args, .. } = proc.block(block).ops[idx].operation.clone()
            else {
                unreachable!("call site moved");
            };

            // Pointer table first, argument payloads behind it.
            let table_bytes = args.len() as u32 * PTR_SIZE;
            let payload_bytes: u32 = args
                .iter()
                .map(|arg| arg.ty.size_bytes(&structs))
                .sum();

            let mut new_ops: Vec<Instruction> = Vec::new();
            let mut push = |proc: &mut Procedure,
                            new_ops: &mut Vec<Instruction>,
                            operation: Operation,
                            out_ty: Option<Type>| {
                let id = proc.new_inst_id();
                let out = out_ty.clone().map(|ty| Variable::inst(id, ty));
                new_ops.push(Instruction::new(id, operation, out_ty));
                out
            };

            let array = push(
                proc,
                &mut new_ops,
                Operation::HeapAlloc {
                    elem: Type::Scalar(ElemType::U8),
                    count: Variable::u32(table_bytes + payload_bytes),
                },
                Some(byte_ptr()),
            )
            .expect("allocation yields a pointer");
            let table = push(
                proc,
                &mut new_ops,
                Operation::Cast {
                    value: array.clone(),
                    to: arg_array_ty(),
                },
                Some(arg_array_ty()),
            )
            .expect("cast yields a value");

            let mut payload_offset = table_bytes;
            for (index, arg) in args.iter().enumerate() {
                let payload = push(
                    proc,
                    &mut new_ops,
                    Operation::IndexAddr {
                        base: array.clone(),
                        index: Variable::u32(payload_offset),
                    },
                    Some(byte_ptr()),
                )
                .expect("address computation yields a value");
                let typed = push(
                    proc,
                    &mut new_ops,
                    Operation::Cast {
                        value: payload.clone(),
                        to: arg.ty.clone().ptr_to(),
                    },
                    Some(arg.ty.clone().ptr_to()),
                )
                .expect("cast yields a value");
                push(
                    proc,
                    &mut new_ops,
                    Operation::Store {
                        addr: typed,
                        value: arg.clone(),
                    },
                    None,
                );
                let slot = push(
                    proc,
                    &mut new_ops,
                    Operation::IndexAddr {
                        base: table.clone(),
                        index: Variable::u32(index as u32),
                    },
                    Some(arg_array_ty()),
                )
                .expect("address computation yields a value");
                push(
                    proc,
                    &mut new_ops,
                    Operation::Store {
                        addr: slot,
                        value: payload,
                    },
                    None,
                );
                payload_offset += arg.ty.size_bytes(&structs);
            }

            let target = push(
                proc,
                &mut new_ops,
                Operation::Cast {
                    value: Variable::proc_addr(original_name),
                    to: byte_ptr(),
                },
                Some(byte_ptr()),
            )
            .expect("cast yields a value");
            push(
                proc,
                &mut new_ops,
                Operation::Call {
                    callee: launch_entry.to_string(),
                    args: vec![target, table],
                },
                None,
            );
            push(
                proc,
                &mut new_ops,
                Operation::HeapFree { ptr: array },
                None,
            );

            // Splice in place of the original kernel call.
            let ordered: Vec<usize> = proc.block(block).ops.indices().collect();
            let mut rebuilt: Vec<Instruction> = Vec::new();
            for existing in ordered {
                if existing == idx {
                    rebuilt.append(&mut new_ops);
                } else {
                    rebuilt.push(proc.block(block).ops[existing].clone());
                }
            }
            proc.rebuild_ops(block, rebuilt);
        }
    }
}

fn find_call_site(
    module: &Module,
    proc_name: &str,
    original_name: &str,
) -> Option<(gridfold_ir::NodeIndex, usize)> {
    let proc = module.proc(proc_name)?;
    for block in proc.body.node_indices() {
        for (idx, inst) in proc.block(block).ops_in_order() {
            if let Operation::Call { callee, .. } = &inst.operation
                && callee == original_name
            {
                return Some((block, idx));
            }
        }
    }
    None
}
