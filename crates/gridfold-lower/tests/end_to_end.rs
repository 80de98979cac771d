//! End-to-end scenarios: build a kernel the way a frontend would, lower it,
//! then execute the rewritten host call site through the reference
//! interpreter and check the memory it produced. Every scenario also checks
//! that the lowered code frees what it allocates.

mod common;

use common::*;
use gridfold_ir::interp::{Interp, Val};
use gridfold_lower::Options;
use pretty_assertions::assert_eq;

fn dim3(x: u32, y: u32, z: u32) -> Val {
    Val::Dim3(x, y, z)
}

fn run_vec_add(options: Options) {
    let mut module = vec_add_module();
    lower(&mut module, options);

    let n = 1000usize;
    let a: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();
    let b: Vec<f32> = (0..n).map(|i| (n - i) as f32 * 0.25).collect();

    let mut interp = Interp::new(&module);
    let pa = interp.alloc_raw(4 * n as u64);
    let pb = interp.alloc_raw(4 * n as u64);
    let pc = interp.alloc_raw(4 * n as u64);
    interp.write_f32s(pa, &a);
    interp.write_f32s(pb, &b);

    let blocks = n.div_ceil(512) as u32;
    let live_before = interp.live_allocations();
    interp
        .call(
            "host_vec_add",
            vec![
                Val::Ptr(pa),
                Val::Ptr(pb),
                Val::Ptr(pc),
                Val::UInt(n as u64, gridfold_ir::ElemType::U32),
                dim3(blocks, 1, 1),
                dim3(512, 1, 1),
            ],
        )
        .unwrap();
    assert_eq!(interp.live_allocations(), live_before);

    let expected: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
    assert_eq!(interp.read_f32s(pc, n), expected);
}

#[test]
fn vec_add_matches_elementwise_sum() {
    run_vec_add(Options::default());
}

#[test]
fn vec_add_with_linear_thread_loop() {
    run_vec_add(Options {
        single_dim_thread_loop: true,
        ..Options::default()
    });
}

#[test]
fn vec_add_with_dynamic_preserved_array() {
    run_vec_add(Options {
        dynamic_preserved_data_array: true,
        ..Options::default()
    });
}

#[test]
fn vec_add_without_subkernel_inlining() {
    run_vec_add(Options {
        inline_subkernels: false,
        ..Options::default()
    });
}

#[test]
fn vec_add_self_contained_variant() {
    run_vec_add(Options {
        use_self_contained_kernel: true,
        ..Options::default()
    });
}

#[test]
fn mat_mul_matches_reference() {
    let mut module = mat_mul_module();
    let lowered = lower(&mut module, Options::default());
    // Three barrier-free regions: prologue and tile load, the accumulation
    // loop, and the advance/epilogue.
    assert_eq!(lowered[0].subkernels.len(), 3);
    assert!(!lowered[0].preserved_fields.is_empty());

    let n = (2 * TILE) as usize;
    let a: Vec<f32> = (0..n * n).map(|i| ((i % 7) as f32) * 0.5).collect();
    let b: Vec<f32> = (0..n * n).map(|i| ((i % 5) as f32) * 0.25).collect();

    let mut interp = Interp::new(&module);
    let pa = interp.alloc_raw(4 * (n * n) as u64);
    let pb = interp.alloc_raw(4 * (n * n) as u64);
    let pc = interp.alloc_raw(4 * (n * n) as u64);
    interp.write_f32s(pa, &a);
    interp.write_f32s(pb, &b);

    let live_before = interp.live_allocations();
    interp
        .call(
            "host_mat_mul",
            vec![
                Val::Ptr(pa),
                Val::Ptr(pb),
                Val::Ptr(pc),
                Val::UInt(n as u64, gridfold_ir::ElemType::U32),
                dim3(2, 2, 1),
                dim3(TILE, TILE, 1),
            ],
        )
        .unwrap();
    assert_eq!(interp.live_allocations(), live_before);

    let mut expected = vec![0f32; n * n];
    for row in 0..n {
        for col in 0..n {
            let mut acc = 0f32;
            for k in 0..n {
                acc += a[row * n + k] * b[k * n + col];
            }
            expected[row * n + col] = acc;
        }
    }
    let got = interp.read_f32s(pc, n * n);
    for (idx, (g, e)) in got.iter().zip(&expected).enumerate() {
        let tolerance = e.abs().max(1.0) * 1e-6;
        assert!(
            (g - e).abs() <= tolerance,
            "c[{idx}] = {g}, expected {e}"
        );
    }
}

fn run_loop_barrier(iters: u32) {
    let mut module = loop_barrier_module();
    lower(&mut module, Options::default());

    let width = 4usize;
    let mut interp = Interp::new(&module);
    let out = interp.alloc_raw(4 * width as u64);

    interp
        .call(
            "host_loop_barrier",
            vec![
                Val::Ptr(out),
                Val::UInt(iters as u64, gridfold_ir::ElemType::U32),
                dim3(1, 1, 1),
                dim3(width as u32, 1, 1),
            ],
        )
        .unwrap();

    // acc = Σ_{i<iters} (tid + i)
    let expected: Vec<u32> = (0..width as u32)
        .map(|tid| (0..iters).map(|i| tid + i).sum())
        .collect();
    assert_eq!(interp.read_u32s(out, width), expected);
}

#[test]
fn loop_around_barrier_runs_to_completion() {
    run_loop_barrier(5);
}

#[test]
fn loop_around_barrier_with_zero_iterations() {
    run_loop_barrier(0);
}

#[test]
fn shared_globals_are_lowered_to_the_record() {
    let width = 4u32;
    let mut module = shared_pair_module(width);
    let lowered = lower(&mut module, Options::default());
    assert_eq!(
        lowered[0].static_shared,
        vec!["share2.s1".to_string(), "share2.s2".to_string()]
    );
    assert!(module.global("share2.s1").is_none());
    assert!(module.global("share2.s2").is_none());

    let mut interp = Interp::new(&module);
    let out = interp.alloc_raw(4 * width as u64);
    interp
        .call(
            "host_share2",
            vec![Val::Ptr(out), dim3(1, 1, 1), dim3(width, 1, 1)],
        )
        .unwrap();

    let expected: Vec<u32> = (0..width)
        .map(|t| ((t + 1) % width) + 2 * ((t + 2) % width))
        .collect();
    assert_eq!(interp.read_u32s(out, width as usize), expected);
}

#[test]
fn alloca_across_barrier_is_heap_backed_and_freed() {
    let mut module = alloca_module();
    let lowered = lower(&mut module, Options::default());
    // The promoted allocation is the one preserved value.
    assert_eq!(lowered[0].preserved_fields.len(), 1);

    let width = 6usize;
    let mut interp = Interp::new(&module);
    let out = interp.alloc_raw(4 * width as u64);

    let live_before = interp.live_allocations();
    interp
        .call(
            "host_alloca_temp",
            vec![Val::Ptr(out), dim3(1, 1, 1), dim3(width as u32, 1, 1)],
        )
        .unwrap();
    assert_eq!(interp.live_allocations(), live_before);

    let expected: Vec<u32> = (0..width as u32).map(|t| t * 3).collect();
    assert_eq!(interp.read_u32s(out, width), expected);
}

#[test]
fn pure_values_are_recomputed_not_preserved() {
    let mut module = remat_module();
    let lowered = lower(&mut module, Options::default());
    // Everything crossing the barrier is a pure function of parameters and
    // dims, so the preserved record is empty.
    assert!(lowered[0].preserved_fields.is_empty());

    let blocks = 2u32;
    let width = 4u32;
    let scale = 10u32;
    let total = (blocks * width) as usize;
    let mut interp = Interp::new(&module);
    let out = interp.alloc_raw(4 * total as u64);

    interp
        .call(
            "host_remat_scaled",
            vec![
                Val::Ptr(out),
                Val::UInt(scale as u64, gridfold_ir::ElemType::U32),
                dim3(blocks, 1, 1),
                dim3(width, 1, 1),
            ],
        )
        .unwrap();

    let expected: Vec<u32> = (0..blocks)
        .flat_map(|b| (0..width).map(move |t| b * scale + t))
        .collect();
    assert_eq!(interp.read_u32s(out, total), expected);
}

#[test]
fn dynamic_shared_memory_is_a_launch_sized_buffer() {
    let mut module = dynamic_shared_module();
    let lowered = lower(&mut module, Options::default());
    assert_eq!(lowered[0].dynamic_shared.as_deref(), Some("dynshared.buf"));
    assert!(module.global("dynshared.buf").is_none());

    let width = 8u32;
    let mut interp = Interp::new(&module);
    let out = interp.alloc_raw(4 * width as u64);

    let live_before = interp.live_allocations();
    interp
        .call(
            "host_dynshared",
            vec![Val::Ptr(out), dim3(1, 1, 1), dim3(width, 1, 1)],
        )
        .unwrap();
    assert_eq!(interp.live_allocations(), live_before);

    let expected: Vec<u32> = (0..width).map(|t| ((t + 1) % width) + 5).collect();
    assert_eq!(interp.read_u32s(out, width as usize), expected);
}
