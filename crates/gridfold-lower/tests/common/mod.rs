//! Scenario kernels shared by the integration suites, built directly against
//! the IR builder the way a frontend would emit them: dim queries and
//! barriers as intrinsic calls, shared memory as attributed globals, launches
//! as push-configuration plus a direct kernel call.
#![allow(dead_code)]

use gridfold_ir::{
    ArithmeticOp::{Add, Div, Mul, Rem},
    ComparisonOp::{GreaterEqual, Lower},
    ElemType, GlobalVar, Module, Param, PhiEntry, ProcBuilder, Type, Variable,
    symbols::{self, Axis, DimTriple},
};
use gridfold_lower::{KernelLowering, LoweredKernel, Options, runtime};

pub fn u32_ty() -> Type {
    Type::Scalar(ElemType::U32)
}

pub fn f32_ty() -> Type {
    Type::Scalar(ElemType::F32)
}

pub fn f32_ptr() -> Type {
    f32_ty().ptr_to()
}

pub fn u32_ptr() -> Type {
    u32_ty().ptr_to()
}

pub fn dim_query(builder: &mut ProcBuilder, triple: DimTriple, axis: Axis) -> Variable {
    builder
        .call(symbols::dim_query_name(triple, axis), vec![], Some(u32_ty()))
        .unwrap()
}

pub fn barrier(builder: &mut ProcBuilder) {
    builder.call(symbols::BARRIER, vec![], None);
}

/// A host procedure that pushes a launch configuration and calls the kernel
/// directly; the lowering rewrites the call into the launch runtime.
pub fn add_host(
    module: &mut Module,
    host_name: &str,
    kernel_name: &str,
    kernel_params: Vec<Param>,
    shared_mem: u64,
) {
    let mut params = kernel_params;
    let arg_count = params.len() as u16;
    params.push(Param::new("grid_dim", Type::Dim3));
    params.push(Param::new("block_dim", Type::Dim3));
    let mut builder = ProcBuilder::new(host_name, params, None);
    let grid = builder.param(arg_count);
    let block = builder.param(arg_count + 1);
    builder.call(
        symbols::PUSH_CONFIGURATION,
        vec![grid, block, Variable::u64(shared_mem)],
        None,
    );
    let args = (0..arg_count).map(|i| builder.param(i)).collect();
    builder.call(kernel_name, args, None);
    builder.ret(None);
    module.add_proc(builder.finish());
}

pub fn lower(module: &mut Module, options: Options) -> Vec<LoweredKernel> {
    KernelLowering::new(options).run(module).expect("lowering succeeds")
}

/// Scenario (a): `c[i] = a[i] + b[i]`, no barrier.
pub fn vec_add_module() -> Module {
    let mut module = Module::default();
    runtime::declare_support(&mut module);

    let params = vec![
        Param::new("a", f32_ptr()),
        Param::new("b", f32_ptr()),
        Param::new("c", f32_ptr()),
        Param::new("n", u32_ty()),
    ];
    let mut b = ProcBuilder::kernel("vec_add", params.clone());
    let bdim = dim_query(&mut b, DimTriple::BlockDim, Axis::X);
    let bidx = dim_query(&mut b, DimTriple::BlockIdx, Axis::X);
    let tidx = dim_query(&mut b, DimTriple::ThreadIdx, Axis::X);
    let base = b.arith(Mul, bdim, bidx);
    let i = b.arith(Add, base, tidx);
    let n = b.param(3);
    let in_bounds = b.cmp(Lower, i.clone(), n);
    let then_block = b.create_block();
    let done = b.create_block();
    b.cond_branch(in_bounds, then_block, done);

    b.switch_to(then_block);
    let a = b.param(0);
    let pa = b.index_addr(a, i.clone());
    let va = b.load(pa);
    let bb = b.param(1);
    let pb = b.index_addr(bb, i.clone());
    let vb = b.load(pb);
    let sum = b.arith(Add, va, vb);
    let c = b.param(2);
    let pc = b.index_addr(c, i);
    b.store(pc, sum);
    b.branch(done);

    b.switch_to(done);
    b.ret(None);
    module.add_proc(b.finish());

    add_host(&mut module, "host_vec_add", "vec_add", params, 0);
    module
}

pub const TILE: u32 = 8;

/// Scenario (b): tiled matrix multiply with two barriers inside the tile
/// loop, accumulating through φ-nodes.
pub fn mat_mul_module() -> Module {
    let mut module = Module::default();
    runtime::declare_support(&mut module);

    let tile_array = f32_ty().array_of(TILE * TILE);
    module.add_global(GlobalVar::shared_static("mat_mul.sa", tile_array.clone()));
    module.add_global(GlobalVar::shared_static("mat_mul.sb", tile_array.clone()));

    let params = vec![
        Param::new("a", f32_ptr()),
        Param::new("b", f32_ptr()),
        Param::new("c", f32_ptr()),
        Param::new("n", u32_ty()),
    ];
    let mut b = ProcBuilder::kernel("mat_mul", params.clone());

    // entry: row/col/tile-base from the dim intrinsics.
    let tile = Variable::u32(TILE);
    let tidx = dim_query(&mut b, DimTriple::ThreadIdx, Axis::X);
    let tidy = dim_query(&mut b, DimTriple::ThreadIdx, Axis::Y);
    let bidx = dim_query(&mut b, DimTriple::BlockIdx, Axis::X);
    let bidy = dim_query(&mut b, DimTriple::BlockIdx, Axis::Y);
    let row_base = b.arith(Mul, bidy, tile.clone());
    let row = b.arith(Add, row_base, tidy.clone());
    let col_base = b.arith(Mul, bidx, tile.clone());
    let col = b.arith(Add, col_base, tidx.clone());
    let tbase_row = b.arith(Mul, tidy.clone(), tile.clone());
    let tbase = b.arith(Add, tbase_row, tidx.clone());
    let n = b.param(3);
    let ntiles = b.arith(Div, n.clone(), tile.clone());

    let hdr = b.create_block();
    let body = b.create_block();
    let after = b.create_block();
    let inner_hdr = b.create_block();
    let inner_body = b.create_block();
    let post_inner = b.create_block();

    let entry = b.entry();
    b.branch(hdr);

    // hdr: t and acc circulate through the tile loop.
    let t = b.phi(hdr, u32_ty(), vec![(entry, Variable::u32(0))]);
    let acc = b.phi(hdr, f32_ty(), vec![(entry, Variable::f32(0.0))]);
    b.switch_to(hdr);
    let t_done = b.cmp(GreaterEqual, t.clone(), ntiles);
    b.cond_branch(t_done, after, body);

    // body: load one tile of each operand into shared memory.
    b.switch_to(body);
    let sa = Variable::global_addr("mat_mul.sa", tile_array.clone());
    let sb = Variable::global_addr("mat_mul.sb", tile_array.clone());
    let tcol_base = b.arith(Mul, t.clone(), tile.clone());
    let acol = b.arith(Add, tcol_base.clone(), tidx.clone());
    let arow_off = b.arith(Mul, row.clone(), n.clone());
    let aidx = b.arith(Add, arow_off, acol);
    let a_param = b.param(0);
    let pa = b.index_addr(a_param, aidx);
    let va = b.load(pa);
    let sa_slot = b.index_addr(sa.clone(), tbase.clone());
    b.store(sa_slot, va);

    let brow = b.arith(Add, tcol_base, tidy.clone());
    let brow_off = b.arith(Mul, brow, n.clone());
    let bidx_flat = b.arith(Add, brow_off, col.clone());
    let b_param = b.param(1);
    let pb = b.index_addr(b_param, bidx_flat);
    let vb = b.load(pb);
    let sb_slot = b.index_addr(sb.clone(), tbase.clone());
    b.store(sb_slot, vb);
    barrier(&mut b);
    b.branch(inner_hdr);

    // inner_hdr: k and the running accumulator.
    let k = b.phi(inner_hdr, u32_ty(), vec![(body, Variable::u32(0))]);
    let acci = b.phi(inner_hdr, f32_ty(), vec![(body, acc.clone())]);
    b.switch_to(inner_hdr);
    let k_done = b.cmp(GreaterEqual, k.clone(), tile.clone());
    b.cond_branch(k_done, post_inner, inner_body);

    b.switch_to(inner_body);
    let sa_row = b.arith(Mul, tidy.clone(), tile.clone());
    let sa_off = b.arith(Add, sa_row, k.clone());
    let sa_k = b.index_addr(sa, sa_off);
    let va_k = b.load(sa_k);
    let sb_row = b.arith(Mul, k.clone(), tile.clone());
    let sb_off = b.arith(Add, sb_row, tidx.clone());
    let sb_k = b.index_addr(sb, sb_off);
    let vb_k = b.load(sb_k);
    let prod = b.arith(Mul, va_k, vb_k);
    let acci2 = b.arith(Add, acci.clone(), prod);
    let k2 = b.arith(Add, k.clone(), Variable::u32(1));
    b.branch(inner_hdr);
    push_phi_entry(&mut b, inner_hdr, &k, inner_body, k2);
    push_phi_entry(&mut b, inner_hdr, &acci, inner_body, acci2);

    // post_inner: wait out the tile, advance t.
    b.switch_to(post_inner);
    barrier(&mut b);
    let t2 = b.arith(Add, t.clone(), Variable::u32(1));
    b.branch(hdr);
    push_phi_entry(&mut b, hdr, &t, post_inner, t2);
    push_phi_entry(&mut b, hdr, &acc, post_inner, acci);

    // after: write the dot product.
    b.switch_to(after);
    let crow_off = b.arith(Mul, row, n);
    let cidx = b.arith(Add, crow_off, col);
    let c_param = b.param(2);
    let pc = b.index_addr(c_param, cidx);
    b.store(pc, acc);
    b.ret(None);

    module.add_proc(b.finish());
    add_host(&mut module, "host_mat_mul", "mat_mul", params, 0);
    module
}

/// Scenario (c): a loop whose body crosses a barrier once per iteration.
/// Each thread accumulates `thread_idx.x + i` over `iters` iterations.
pub fn loop_barrier_module() -> Module {
    let mut module = Module::default();
    runtime::declare_support(&mut module);

    let params = vec![
        Param::new("out", u32_ptr()),
        Param::new("iters", u32_ty()),
    ];
    let mut b = ProcBuilder::kernel("loop_barrier", params.clone());
    let tidx = dim_query(&mut b, DimTriple::ThreadIdx, Axis::X);
    let iters = b.param(1);

    let hdr = b.create_block();
    let body = b.create_block();
    let after = b.create_block();
    let entry = b.entry();
    b.branch(hdr);

    let i = b.phi(hdr, u32_ty(), vec![(entry, Variable::u32(0))]);
    let acc = b.phi(hdr, u32_ty(), vec![(entry, Variable::u32(0))]);
    b.switch_to(hdr);
    let done = b.cmp(GreaterEqual, i.clone(), iters);
    b.cond_branch(done, after, body);

    b.switch_to(body);
    let step = b.arith(Add, tidx.clone(), i.clone());
    let acc2 = b.arith(Add, acc.clone(), step);
    barrier(&mut b);
    let i2 = b.arith(Add, i.clone(), Variable::u32(1));
    b.branch(hdr);
    push_phi_entry(&mut b, hdr, &i, body, i2);
    push_phi_entry(&mut b, hdr, &acc, body, acc2);

    b.switch_to(after);
    let out = b.param(0);
    let slot = b.index_addr(out, tidx);
    b.store(slot, acc);
    b.ret(None);

    module.add_proc(b.finish());
    add_host(&mut module, "host_loop_barrier", "loop_barrier", params, 0);
    module
}

/// Scenario (d): two static shared arrays read and written across a barrier.
pub fn shared_pair_module(block_width: u32) -> Module {
    let mut module = Module::default();
    runtime::declare_support(&mut module);

    let array = u32_ty().array_of(block_width);
    module.add_global(GlobalVar::shared_static("share2.s1", array.clone()));
    module.add_global(GlobalVar::shared_static("share2.s2", array.clone()));

    let params = vec![Param::new("out", u32_ptr())];
    let mut b = ProcBuilder::kernel("share2", params.clone());
    let tidx = dim_query(&mut b, DimTriple::ThreadIdx, Axis::X);
    let bdim = dim_query(&mut b, DimTriple::BlockDim, Axis::X);
    let s1 = Variable::global_addr("share2.s1", array.clone());
    let s2 = Variable::global_addr("share2.s2", array);

    let slot1 = b.index_addr(s1.clone(), tidx.clone());
    b.store(slot1, tidx.clone());
    let doubled = b.arith(Mul, tidx.clone(), Variable::u32(2));
    let slot2 = b.index_addr(s2.clone(), tidx.clone());
    b.store(slot2, doubled);
    barrier(&mut b);

    let shift1 = b.arith(Add, tidx.clone(), Variable::u32(1));
    let wrap1 = b.arith(Rem, shift1, bdim.clone());
    let read1 = b.index_addr(s1, wrap1);
    let v1 = b.load(read1);
    let shift2 = b.arith(Add, tidx.clone(), Variable::u32(2));
    let wrap2 = b.arith(Rem, shift2, bdim);
    let read2 = b.index_addr(s2, wrap2);
    let v2 = b.load(read2);
    let sum = b.arith(Add, v1, v2);
    let out = b.param(0);
    let slot = b.index_addr(out, tidx);
    b.store(slot, sum);
    b.ret(None);

    module.add_proc(b.finish());
    add_host(&mut module, "host_share2", "share2", params, 0);
    module
}

/// Scenario (e): a per-thread stack temporary written before a barrier and
/// read after it.
pub fn alloca_module() -> Module {
    let mut module = Module::default();
    runtime::declare_support(&mut module);

    let params = vec![Param::new("out", u32_ptr())];
    let mut b = ProcBuilder::kernel("alloca_temp", params.clone());
    let tidx = dim_query(&mut b, DimTriple::ThreadIdx, Axis::X);
    let temp = b.stack_alloc(u32_ty(), Variable::u32(1));
    let tripled = b.arith(Mul, tidx.clone(), Variable::u32(3));
    b.store(temp.clone(), tripled);
    barrier(&mut b);
    let value = b.load(temp);
    let out = b.param(0);
    let slot = b.index_addr(out, tidx);
    b.store(slot, value);
    b.ret(None);

    module.add_proc(b.finish());
    add_host(&mut module, "host_alloca_temp", "alloca_temp", params, 0);
    module
}

/// Scenario (f): the live-across value is a pure function of parameters and
/// dims, so it is recomputed after the barrier instead of preserved.
pub fn remat_module() -> Module {
    let mut module = Module::default();
    runtime::declare_support(&mut module);

    let params = vec![
        Param::new("out", u32_ptr()),
        Param::new("scale", u32_ty()),
    ];
    let mut b = ProcBuilder::kernel("remat_scaled", params.clone());
    let bidx = dim_query(&mut b, DimTriple::BlockIdx, Axis::X);
    let bdim = dim_query(&mut b, DimTriple::BlockDim, Axis::X);
    let tidx = dim_query(&mut b, DimTriple::ThreadIdx, Axis::X);
    let scale = b.param(1);
    let v = b.arith(Mul, bidx.clone(), scale);
    barrier(&mut b);
    let base = b.arith(Mul, bidx, bdim);
    let linear = b.arith(Add, base, tidx.clone());
    let value = b.arith(Add, v, tidx);
    let out = b.param(0);
    let slot = b.index_addr(out, linear);
    b.store(slot, value);
    b.ret(None);

    module.add_proc(b.finish());
    add_host(&mut module, "host_remat_scaled", "remat_scaled", params, 0);
    module
}

/// Append a back-edge entry to a φ created before its incoming value existed.
fn push_phi_entry(
    builder: &mut ProcBuilder,
    block: gridfold_ir::NodeIndex,
    phi_out: &Variable,
    pred: gridfold_ir::NodeIndex,
    value: Variable,
) {
    let phis = &mut builder.proc_mut().block_mut(block).phi_nodes;
    let phi = phis
        .iter_mut()
        .find(|phi| &phi.out == phi_out)
        .expect("phi exists");
    phi.entries.push(PhiEntry { block: pred, value });
}

/// Dynamic shared memory: a declaration-only shared global, sized at launch,
/// written before a barrier and read after it.
pub fn dynamic_shared_module() -> Module {
    let mut module = Module::default();
    runtime::declare_support(&mut module);

    let elem_array = u32_ty().array_of(0);
    module.add_global(GlobalVar::shared_dynamic("dynshared.buf", elem_array.clone()));

    let params = vec![Param::new("out", u32_ptr())];
    let mut b = ProcBuilder::kernel("dynshared", params.clone());
    let tidx = dim_query(&mut b, DimTriple::ThreadIdx, Axis::X);
    let bdim = dim_query(&mut b, DimTriple::BlockDim, Axis::X);
    let buf = Variable::global_addr("dynshared.buf", elem_array);

    let slot = b.index_addr(buf.clone(), tidx.clone());
    let seeded = b.arith(Add, tidx.clone(), Variable::u32(5));
    b.store(slot, seeded);
    barrier(&mut b);

    let shifted = b.arith(Add, tidx.clone(), Variable::u32(1));
    let wrapped = b.arith(Rem, shifted, bdim);
    let read = b.index_addr(buf, wrapped);
    let value = b.load(read);
    let out = b.param(0);
    let out_slot = b.index_addr(out, tidx);
    b.store(out_slot, value);
    b.ret(None);

    module.add_proc(b.finish());
    // shared_mem_size covers one u32 per thread of the widest block used.
    add_host(&mut module, "host_dynshared", "dynshared", params, 4 * 8);
    module
}

/// Invalid input: two distinct dynamic shared globals in one kernel.
pub fn two_dynamic_shared_module() -> Module {
    let mut module = Module::default();
    runtime::declare_support(&mut module);

    let elem_array = u32_ty().array_of(0);
    module.add_global(GlobalVar::shared_dynamic("bad.d1", elem_array.clone()));
    module.add_global(GlobalVar::shared_dynamic("bad.d2", elem_array.clone()));

    let mut b = ProcBuilder::kernel("bad_dyn", vec![]);
    let tidx = dim_query(&mut b, DimTriple::ThreadIdx, Axis::X);
    let d1 = Variable::global_addr("bad.d1", elem_array.clone());
    let d2 = Variable::global_addr("bad.d2", elem_array);
    let s1 = b.index_addr(d1, tidx.clone());
    b.store(s1, tidx.clone());
    barrier(&mut b);
    let s2 = b.index_addr(d2, tidx.clone());
    b.store(s2, tidx);
    b.ret(None);
    module.add_proc(b.finish());
    module
}
