//! gridfold-lower: the kernel splitting transformation. Every procedure
//! marked as a kernel entry is decomposed at its barriers into subkernels,
//! live-across values are materialised through a per-thread preserved-data
//! record, and the pieces are reassembled under a per-block driver plus two
//! outer variants exposed to the host launch runtime.

mod allocas;
pub mod analyses;
mod barriers;
mod consts;
mod dim3;
mod driver;
mod error;
mod inline;
mod outer;
mod phi_repair;
mod preserved;
pub mod runtime;
mod splitter;
mod subkernels;
mod synthesis;

pub use error::{LowerError, Result};
pub use preserved::PreservedValue;
pub use splitter::LoweredKernel;
pub use subkernels::SubkernelId;

use gridfold_ir::Module;

/// Preserved-data arrays sized statically cover one full block.
pub const MAX_THREADS_PER_BLOCK: u32 = 1024;

/// Compile-time configuration of the lowering, threaded into the pass at
/// construction.
#[derive(Debug, Clone)]
pub struct Options {
    /// Which outer variant takes the kernel's original name: the wrapper
    /// (false) or the self-contained grid-looping variant (true).
    pub use_self_contained_kernel: bool,
    /// Drive the per-thread iteration with a single linear loop instead of
    /// the (z, y, x) triple loop. Off by default; the triple loop measures
    /// about twice as fast.
    pub single_dim_thread_loop: bool,
    /// Heap-allocate the per-thread preserved-data array. On by default; a
    /// block's worth of records overflows stacks easily.
    pub heap_preserved_data_array: bool,
    /// Size the preserved-data array by the actual block size instead of
    /// `MAX_THREADS_PER_BLOCK`.
    pub dynamic_preserved_data_array: bool,
    /// Inline the subkernel calls into the driver after emission.
    pub inline_subkernels: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            use_self_contained_kernel: false,
            single_dim_thread_loop: false,
            heap_preserved_data_array: true,
            dynamic_preserved_data_array: false,
            inline_subkernels: true,
        }
    }
}

/// The lowering pass. `run` transforms every kernel entry of a module and
/// rewrites their launch call sites; afterwards no kernel-entry attribute,
/// barrier intrinsic or shared global remains.
pub struct KernelLowering {
    options: Options,
}

impl KernelLowering {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    pub fn run(&self, module: &mut Module) -> Result<Vec<LoweredKernel>> {
        consts::flatten(module)?;

        let kernels = module.kernel_entries();
        let mut lowered = Vec::with_capacity(kernels.len());
        for name in &kernels {
            log::debug!("lowering kernel @{name}");
            lowered.push(splitter::split_kernel(module, name, &self.options)?);
        }

        for kernel in &lowered {
            outer::rewrite_call_sites(module, &kernel.original, &self.options);
        }

        self.cleanup(module, &mut lowered);
        Ok(lowered)
    }

    /// Erase the consumed pieces: the original kernels (the chosen outer
    /// variant takes each original name), the shared globals, and the
    /// intrinsic and helper declarations. Dynamic shared declarations can be
    /// referenced by several kernels, so they go last, once.
    fn cleanup(&self, module: &mut Module, lowered: &mut [LoweredKernel]) {
        for kernel in lowered.iter_mut() {
            module.remove_proc(&kernel.original);
            let chosen = if self.options.use_self_contained_kernel {
                kernel.self_contained.clone()
            } else {
                kernel.wrapper.clone()
            };
            module
                .proc_mut(&chosen)
                .expect("outer variant was emitted")
                .name = kernel.original.clone();
            if self.options.use_self_contained_kernel {
                kernel.self_contained = kernel.original.clone();
            } else {
                kernel.wrapper = kernel.original.clone();
            }

            for name in &kernel.static_shared {
                module.remove_global(name);
            }
        }

        let mut dynamics: Vec<String> = lowered
            .iter()
            .filter_map(|kernel| kernel.dynamic_shared.clone())
            .collect();
        dynamics.sort();
        dynamics.dedup();
        for name in dynamics {
            module.remove_global(&name);
        }

        runtime::erase_support(module);
    }
}
