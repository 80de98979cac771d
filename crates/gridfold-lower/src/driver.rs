//! Driver assembly: the per-block emulator. The driver allocates the shared
//! and preserved records, then loops a ⟨from, next⟩ trampoline: dispatch on
//! `next`, run every thread of the block through the chosen subkernel, and
//! let the subkernel's return value drive the next dispatch. Threads run in
//! (z, y, x) lexicographic order, so a barrier boundary is respected by
//! construction.

use gridfold_ir::{
    ArithmeticOp, ComparisonOp, ElemType, Module, NodeIndex, Operation, Param, ProcBuilder,
    StructId, Type, Variable, symbols,
};

use crate::error::Result;
use crate::inline;
use crate::preserved::{PreservedLayout, SharedLayout};
use crate::subkernels::Subkernels;
use crate::synthesis::subkernel_name;
use crate::{MAX_THREADS_PER_BLOCK, Options};

fn u32_ty() -> Type {
    Type::Scalar(ElemType::U32)
}

fn i32_ty() -> Type {
    Type::Scalar(ElemType::I32)
}

/// A counted `for idx in 0..bound` loop built from raw blocks, with the
/// induction variable in a stack slot. `hook_up` wires the body in; the
/// caller branches to `head` and continues from `end`.
pub(crate) struct CountedLoop {
    pub head: NodeIndex,
    cond: NodeIndex,
    incr: NodeIndex,
    pub end: NodeIndex,
    done: Variable,
    /// The induction value, loaded in the condition block.
    pub idx: Variable,
}

impl CountedLoop {
    pub fn build(builder: &mut ProcBuilder, bound: Variable, alloc_block: NodeIndex) -> Self {
        let saved = builder.current;

        builder.switch_to(alloc_block);
        let idx_ptr = builder.stack_alloc(u32_ty(), Variable::u32(1));

        let head = builder.create_block();
        let cond = builder.create_block();
        let incr = builder.create_block();
        let end = builder.create_block();

        builder.switch_to(head);
        builder.store(idx_ptr.clone(), Variable::u32(0));
        builder.branch(cond);

        builder.switch_to(cond);
        let idx = builder.load(idx_ptr.clone());
        let done = builder.cmp(ComparisonOp::Equal, idx.clone(), bound);

        builder.switch_to(incr);
        let next = builder.arith(ArithmeticOp::Add, idx.clone(), Variable::u32(1));
        builder.store(idx_ptr, next);
        builder.branch(cond);

        builder.switch_to(saved);
        Self {
            head,
            cond,
            incr,
            end,
            done,
            idx,
        }
    }

    /// Wire the loop around a body: the condition falls into `body_entry`
    /// while not done, and `body_end` loops back through the increment.
    pub fn hook_up(&self, builder: &mut ProcBuilder, body_entry: NodeIndex, body_end: NodeIndex) {
        let saved = builder.current;
        builder.switch_to(self.cond);
        builder.cond_branch(self.done.clone(), self.end, body_entry);
        builder.switch_to(body_end);
        builder.branch(self.incr);
        builder.switch_to(saved);
    }
}

pub(crate) fn driver_name(original: &str) -> String {
    format!("{original}.driver")
}

/// Extract one axis of a dim value by cloning the getter helper in place.
pub(crate) fn dim_axis(
    builder: &mut ProcBuilder,
    module: &Module,
    dim: Variable,
    axis: usize,
) -> Result<Variable> {
    let name = symbols::DIM3_GET[axis];
    builder.call(name, vec![dim], Some(u32_ty()));
    let block = builder.current;
    let idx = builder
        .proc()
        .block(block)
        .ops_in_order()
        .last()
        .map(|(idx, _)| idx)
        .expect("call just pushed");
    let value = inline::inline_helper(builder.proc_mut(), module, name, block, idx)?;
    Ok(value.expect("dim getter returns a value"))
}

/// Construct a dim value from three axes by cloning the constructor helper.
pub(crate) fn construct_dim3(
    builder: &mut ProcBuilder,
    module: &Module,
    x: Variable,
    y: Variable,
    z: Variable,
) -> Result<Variable> {
    builder.call(symbols::CONSTRUCT_DIM3, vec![x, y, z], Some(Type::Dim3));
    let block = builder.current;
    let idx = builder
        .proc()
        .block(block)
        .ops_in_order()
        .last()
        .map(|(idx, _)| idx)
        .expect("call just pushed");
    let value =
        inline::inline_helper(builder.proc_mut(), module, symbols::CONSTRUCT_DIM3, block, idx)?;
    Ok(value.expect("dim constructor returns a value"))
}

/// Build the driver procedure for a lowered kernel.
///
/// Signature: `(original-params…, grid_dim, block_idx, block_dim,
/// shared_mem_size)`.
#[allow(clippy::too_many_arguments)]
pub fn build(
    module: &mut Module,
    original_name: &str,
    original_params: &[Param],
    subs: &Subkernels,
    preserved: &PreservedLayout,
    shared: &SharedLayout,
    pair_struct: StructId,
    options: &Options,
) -> Result<String> {
    let mut params: Vec<Param> = original_params.to_vec();
    let grid_dim_at = params.len() as u16;
    params.push(Param::new("gridDim", Type::Dim3));
    params.push(Param::new("blockIdx", Type::Dim3));
    params.push(Param::new("blockDim", Type::Dim3));
    params.push(Param::new("shared_mem_size", Type::Scalar(ElemType::U64)));

    let mut builder = ProcBuilder::new(driver_name(original_name), params, None);
    let entry = builder.entry();
    let pair_ty = Type::Struct(pair_struct);

    let block_dim = builder.param(grid_dim_at + 2);
    let shared_mem_size = builder.param(grid_dim_at + 3);

    let ret_slot = builder.stack_alloc(pair_ty.clone(), Variable::u32(1));
    let dim_x = dim_axis(&mut builder, module, block_dim.clone(), 0)?;
    let dim_y = dim_axis(&mut builder, module, block_dim.clone(), 1)?;
    let dim_z = dim_axis(&mut builder, module, block_dim, 2)?;

    let shared_rec = builder.heap_alloc(Type::Struct(shared.struct_id), Variable::u32(1));
    let dyn_shared = builder.heap_alloc(Type::Scalar(ElemType::U8), shared_mem_size);

    let xy = builder.arith(ArithmeticOp::Mul, dim_x.clone(), dim_y.clone());
    let block_size = builder.arith(ArithmeticOp::Mul, xy, dim_z.clone());

    let preserved_count = if options.dynamic_preserved_data_array {
        block_size.clone()
    } else {
        Variable::u32(MAX_THREADS_PER_BLOCK)
    };
    let preserved_ty = Type::Struct(preserved.struct_id);
    let preserved_array = if options.heap_preserved_data_array {
        builder.heap_alloc(preserved_ty, preserved_count)
    } else {
        builder.stack_alloc(preserved_ty, preserved_count)
    };

    let from_ptr = builder.field_addr(ret_slot.clone(), 0, i32_ty());
    builder.store(from_ptr.clone(), Variable::i32(-1));
    let next_ptr = builder.field_addr(ret_slot.clone(), 1, i32_ty());
    builder.store(next_ptr.clone(), Variable::i32(subs.entry_subkernel as i32));

    let header = builder.create_block();
    builder.branch(header);

    builder.switch_to(header);
    let next = builder.load(next_ptr);
    let from = builder.load(from_ptr);

    let exit = builder.create_block();
    let mut cases: Vec<(i64, NodeIndex)> = Vec::new();

    for sk in subs.ids() {
        let case_block = builder.create_block();
        cases.push((sk as i64, case_block));

        let body = builder.create_block();
        builder.switch_to(body);

        let (thread_x, thread_y, thread_z, preserved_idx);
        let loops_entry;
        let outer_end;
        if options.single_dim_thread_loop {
            let linear = CountedLoop::build(&mut builder, block_size.clone(), entry);
            builder.switch_to(body);
            thread_x = builder.arith(ArithmeticOp::Rem, linear.idx.clone(), dim_x.clone());
            let rest = builder.arith(ArithmeticOp::Div, linear.idx.clone(), dim_x.clone());
            thread_y = builder.arith(ArithmeticOp::Rem, rest.clone(), dim_y.clone());
            let rest = builder.arith(ArithmeticOp::Div, rest, dim_y.clone());
            thread_z = builder.arith(ArithmeticOp::Rem, rest, dim_z.clone());
            preserved_idx = linear.idx.clone();
            linear.hook_up(&mut builder, body, body);
            loops_entry = linear.head;
            outer_end = linear.end;
        } else {
            let loop_z = CountedLoop::build(&mut builder, dim_z.clone(), entry);
            let loop_y = CountedLoop::build(&mut builder, dim_y.clone(), entry);
            let loop_x = CountedLoop::build(&mut builder, dim_x.clone(), entry);
            loop_z.hook_up(&mut builder, loop_y.head, loop_y.end);
            loop_y.hook_up(&mut builder, loop_x.head, loop_x.end);
            loop_x.hook_up(&mut builder, body, body);

            builder.switch_to(body);
            let zy = builder.arith(ArithmeticOp::Mul, dim_y.clone(), loop_z.idx.clone());
            let zy = builder.arith(ArithmeticOp::Add, loop_y.idx.clone(), zy);
            let zyx = builder.arith(ArithmeticOp::Mul, dim_x.clone(), zy);
            preserved_idx = builder.arith(ArithmeticOp::Add, loop_x.idx.clone(), zyx);
            thread_x = loop_x.idx.clone();
            thread_y = loop_y.idx.clone();
            thread_z = loop_z.idx.clone();
            loops_entry = loop_z.head;
            outer_end = loop_z.end;
        }

        builder.switch_to(body);
        let thread_preserved = builder.index_addr(preserved_array.clone(), preserved_idx);
        let thread_idx = construct_dim3(&mut builder, module, thread_x, thread_y, thread_z)?;

        let mut args = vec![
            from.clone(),
            thread_preserved,
            shared_rec.clone(),
            dyn_shared.clone(),
        ];
        for index in 0..original_params.len() as u16 {
            args.push(builder.param(index));
        }
        args.push(builder.param(grid_dim_at));
        args.push(builder.param(grid_dim_at + 1));
        args.push(builder.param(grid_dim_at + 2));
        args.push(thread_idx);

        let result = builder
            .call(subkernel_name(original_name, sk), args, Some(pair_ty.clone()))
            .expect("subkernel calls return the trampoline pair");
        builder.store(ret_slot.clone(), result);

        builder.switch_to(case_block);
        builder.branch(loops_entry);
        builder.switch_to(outer_end);
        builder.branch(header);
    }

    builder.switch_to(header);
    builder.switch(next, exit, cases);

    builder.switch_to(exit);
    if options.heap_preserved_data_array {
        builder.heap_free(preserved_array);
    }
    builder.heap_free(shared_rec);
    builder.heap_free(dyn_shared);
    builder.ret(None);

    let mut driver = builder.finish();
    if options.inline_subkernels {
        inline_subkernel_calls(&mut driver, module, original_name)?;
    }

    let name = driver.name.clone();
    module.add_proc(driver);
    Ok(name)
}

fn inline_subkernel_calls(
    driver: &mut gridfold_ir::Procedure,
    module: &Module,
    original_name: &str,
) -> Result<()> {
    let prefix = format!("{original_name}.subkernel.");
    loop {
        let mut site = None;
        'scan: for block in driver.body.node_indices() {
            for (idx, inst) in driver.block(block).ops_in_order() {
                if let Operation::Call { callee, .. } = &inst.operation
                    && callee.starts_with(&prefix)
                {
                    site = Some((block, idx, callee.clone()));
                    break 'scan;
                }
            }
        }
        let Some((block, idx, callee)) = site else {
            return Ok(());
        };
        let subkernel = crate::runtime::expect_proc(module, &callee)?.clone();
        inline::inline_call(driver, &subkernel, block, idx);
    }
}
