//! Teaching-grade 32-bit kernel core: a contiguous physical frame
//! allocator, a recursively-self-mapped two-level page table with a
//! per-address-space VM-pool allocator, a cooperative FIFO scheduler, a
//! blocking ATA-style disk driver, and a flat single-level file system —
//! wired together the way a page fault, a blocked `File::Read`, and a
//! disk-ready IRQ actually flow through them at runtime.
//!
//! `#![cfg_attr(not(test), no_std)]` rather than a bare `#![no_std]`: the
//! bitmap/scheduling/file-system logic in every module below is exercised
//! by `cargo test` against the host `std` (per `SPEC_FULL.md` §8), with
//! only the hardware-touching modules (`machine`, `interrupts`, `panic`,
//! and the raw half of `paging`/`disk`) gated out of that build.
//!
//! Unlike the teacher's original nightly-only `#![feature(lang_items, asm,
//! start)]` (`examples/mark-i-m-os2/kernel/lib.rs`), everything here builds
//! on stable: `core::arch::asm!` in place of the `asm!` macro's old
//! unstable form, and `#[panic_handler]` in place of `#[lang =
//! "panic_fmt"]`.

#![cfg_attr(not(test), no_std)]

#[cfg(not(test))]
extern crate rlibc;

pub mod console;
pub mod disk;
pub mod filesystem;
pub mod frame_pool;
pub mod machine;
pub mod paging;
pub mod scheduler;
pub mod types;

#[cfg(not(test))]
mod interrupts;
#[cfg(not(test))]
mod panic;

#[cfg(not(test))]
pub use boot::kernel_main;

/// Boot sequencing and the kernel-services bundle. Per the "static
/// cross-module singletons" design note, `KernelServices` is built once by
/// `kernel_main` and threaded through by `&mut` to whatever needs it (the
/// disk needs the scheduler to park/resume threads; the file system needs
/// the disk) — with one exception: a hardware ISR genuinely has no call
/// stack to thread a reference through, so `KERNEL_SERVICES` below is the
/// single process-wide `spin::Mutex<Option<T>>` static the page-fault and
/// disk-IRQ entry points lock to reach it, matching the teacher's own
/// `static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);`
/// (`examples/mark-i-m-os2/kernel/process/sched.rs`).
#[cfg(not(test))]
mod boot {
    use crate::disk::{AtaPio, BlockingDisk};
    use crate::frame_pool::{bitmap_bytes, needed_info_frames, Bitmap, FramePool, FramePoolRegistry};
    use crate::interrupts::DISK_IRQ_LINE;
    use crate::paging::{PageDirectory, Regs, VmPool};
    use crate::scheduler::{IoWaiter, Scheduler, Tcb};
    use crate::types::{FrameNo, VirtAddr, PAGE_SIZE};

    /// Frames [512, 1024): the kernel's own pool, matching the spec's §8
    /// scenario-1 range. Its bitmaps live in an info-frame prefix of the
    /// pool itself.
    const KERNEL_POOL_BASE: u32 = 512;
    const KERNEL_POOL_FRAMES: u32 = 512;

    /// Frames [1024, 8192): the process pool, matching §8 scenario 2. Its
    /// bitmaps are borrowed from the kernel pool rather than stored inside
    /// itself, since most of this range is not identity-mapped and so
    /// cannot be touched before the fault handler can reach it.
    const PROCESS_POOL_BASE: u32 = 1024;
    const PROCESS_POOL_FRAMES: u32 = 7168;

    /// First 4 MiB identity-mapped at construction: kernel image + the low
    /// I/O region, and not coincidentally exactly where both frame pools'
    /// directly-addressable bitmaps live.
    const SHARED_SIZE: u32 = 4 * 1024 * 1024;

    /// The kernel's own VM pool: everything above the identity-mapped low
    /// region and below the recursive slot's own address range.
    const KERNEL_VM_POOL_BASE: u32 = SHARED_SIZE;
    const KERNEL_VM_POOL_SIZE: u32 = 64 * 1024 * 1024;

    pub struct KernelServices {
        pub frame_pools: FramePoolRegistry<2>,
        pub page_table: PageDirectory,
        pub scheduler: Scheduler,
        pub disk: BlockingDisk<AtaPio>,
    }

    // Every field here is either a raw pointer or holds one (`FramePool`'s
    // `Bitmap::Raw`, `PageDirectory`'s pool/VM-pool pointers, the
    // scheduler's and disk's intrusive `*mut Tcb` queues) and so is !Send
    // by default. This kernel never runs more than one logical thread of
    // control at a time — the ISR entry points below and `kernel_main`'s
    // loop take turns under `KERNEL_SERVICES`'s lock, never concurrently —
    // matching the same single-owner reasoning the pack's device structs
    // rely on for their own `unsafe impl Send` (e.g.
    // `examples/asterism-labs-hadron`'s `VirtioBlkDisk`).
    unsafe impl Send for KernelServices {}

    /// The live kernel state, reachable from `kernel_main`'s loop and from
    /// the ISR bridge functions below — the one static this kernel needs,
    /// per the design note this module's doc comment cites.
    static KERNEL_SERVICES: spin::Mutex<Option<KernelServices>> = spin::Mutex::new(None);

    /// The kernel's VM pool, registered with `KERNEL_SERVICES`'s page table
    /// at construction (`VmPool::new`) so `handle_fault`'s legitimacy walk
    /// can see it. Kept in its own static (rather than as a field of
    /// `KernelServices`) because it borrows that page table by `&'static
    /// mut` — a field can't borrow a sibling field of the same struct.
    static KERNEL_VM_POOL: spin::Mutex<Option<VmPool<'static>>> = spin::Mutex::new(None);

    unsafe fn bring_up_kernel_pool(registry: &mut FramePoolRegistry<2>) {
        let n = KERNEL_POOL_FRAMES;
        let info_frames = needed_info_frames(n);
        let bitmap_len = bitmap_bytes(n);
        let base_addr = KERNEL_POOL_BASE * PAGE_SIZE;

        let alloc_bm = Bitmap::from_raw(base_addr, bitmap_len);
        let head_bm = Bitmap::from_raw(base_addr + bitmap_len as u32, bitmap_len);
        let pool = FramePool::new(FrameNo(KERNEL_POOL_BASE), n, alloc_bm, head_bm, info_frames);
        registry.register(pool);
    }

    unsafe fn bring_up_process_pool(registry: &mut FramePoolRegistry<2>) {
        let n = PROCESS_POOL_FRAMES;
        let info_frames = needed_info_frames(n);
        let bitmap_len = bitmap_bytes(n);

        let kernel_pool = registry
            .pool_mut(FrameNo(KERNEL_POOL_BASE))
            .expect("kernel pool must be brought up first");
        let info_frame = kernel_pool
            .get_frames(info_frames)
            .expect("kernel pool exhausted bringing up the process pool's bitmaps");
        let base_addr = info_frame.0 * PAGE_SIZE;

        let alloc_bm = Bitmap::from_raw(base_addr, bitmap_len);
        let head_bm = Bitmap::from_raw(base_addr + bitmap_len as u32, bitmap_len);
        // info_frames_in_pool = 0: the bitmaps live outside this pool's own
        // range (borrowed from the kernel pool above), so the pool starts
        // entirely FREE rather than pre-marking a run within itself.
        let pool = FramePool::new(FrameNo(PROCESS_POOL_BASE), n, alloc_bm, head_bm, 0);
        registry.register(pool);
    }

    fn init() -> KernelServices {
        let mut frame_pools = FramePoolRegistry::<2>::new();
        unsafe {
            bring_up_kernel_pool(&mut frame_pools);
            bring_up_process_pool(&mut frame_pools);
        }

        let kernel_pool_ptr = frame_pools
            .pool_mut(FrameNo(KERNEL_POOL_BASE))
            .expect("kernel pool missing") as *mut FramePool;
        let process_pool_ptr = frame_pools
            .pool_mut(FrameNo(PROCESS_POOL_BASE))
            .expect("process pool missing") as *mut FramePool;

        let mut page_table = PageDirectory::init_paging(kernel_pool_ptr, process_pool_ptr, SHARED_SIZE);
        page_table.load();
        page_table.enable_paging();

        KernelServices {
            frame_pools,
            page_table,
            scheduler: Scheduler::new(),
            disk: BlockingDisk::new(AtaPio::new()),
        }
    }

    /// First Rust code to run, entered from the boot trampoline (§6) after
    /// the provisional environment hands off: no IDT, no current task, a
    /// temporary low identity map. `init()` stands up the five core
    /// subsystems in their dependency order (C1, then C2 on top of it,
    /// then C3/C4 which don't depend on paging at all), then moves them
    /// into `KERNEL_SERVICES` so the ISR bridge functions below can reach
    /// them before interrupts are unmasked.
    #[no_mangle]
    pub extern "C" fn kernel_main() -> ! {
        crate::kprintln!("kernel_main: bringing up frame pools and paging");
        *KERNEL_SERVICES.lock() = Some(init());

        // Safety: `KERNEL_SERVICES` now owns the page table at its final,
        // process-lifetime address; this pointer is what `VmPool::new`
        // below registers with it, and nothing moves `KernelServices` out
        // of the static again afterward.
        let page_table: &'static mut PageDirectory = unsafe {
            let mut guard = KERNEL_SERVICES.lock();
            &mut *(&mut guard.as_mut().expect("just initialized above").page_table as *mut PageDirectory)
        };
        *KERNEL_VM_POOL.lock() = Some(VmPool::new(
            VirtAddr(KERNEL_VM_POOL_BASE),
            KERNEL_VM_POOL_SIZE,
            page_table,
        ));
        crate::kprintln!("kernel_main: subsystems ready");

        crate::interrupts::init();
        unsafe {
            crate::machine::enable_interrupts();
        }

        let mut idle = Tcb::new(0);
        {
            let mut guard = KERNEL_SERVICES.lock();
            guard.as_mut().unwrap().scheduler.add(&mut idle as *mut Tcb);
        }

        loop {
            // The scheduling decision happens under the lock; the dispatch
            // itself (which may not return to this stack for a long time)
            // happens after it's dropped, so an ISR firing while some other
            // thread runs can still lock `KERNEL_SERVICES`.
            let next = {
                let mut guard = KERNEL_SERVICES.lock();
                let services = guard.as_mut().expect("kernel services not initialized");
                services.scheduler.next_to_run(Some(&mut services.disk))
            };
            match next {
                Some(t) => Scheduler::dispatch(t),
                None => unsafe { crate::machine::hlt() },
            }
        }
    }

    /// Bridge from the page-fault ISR trampoline (`isr_page_fault`,
    /// `interrupts.rs`) into `PageDirectory::handle_fault`. Locks
    /// `KERNEL_SERVICES` rather than taking it as an argument because the
    /// assembly stub that calls this has no Rust-side reference to hand in.
    #[no_mangle]
    pub extern "C" fn page_fault_entry(regs: &Regs) {
        let mut guard = KERNEL_SERVICES.lock();
        let services = guard
            .as_mut()
            .expect("page fault before kernel services were initialized");
        services.page_table.handle_fault(regs);
    }

    /// Bridge from the disk IRQ trampoline (`irq_disk`, `interrupts.rs`)
    /// into the blocking disk's resume logic, then acknowledges the IRQ so
    /// the PIC delivers the next one.
    #[no_mangle]
    pub extern "C" fn disk_irq_entry() {
        let mut guard = KERNEL_SERVICES.lock();
        let services = guard
            .as_mut()
            .expect("disk IRQ before kernel services were initialized");
        services.disk.resume(&mut services.scheduler);
        crate::interrupts::eoi(DISK_IRQ_LINE);
    }
}
