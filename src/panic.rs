//! Panic handling: log a one-line diagnostic to the serial console, then
//! halt forever.
//!
//! In the manner of the teacher's `bare_bones::rust_begin_panic`
//! (`examples/mark-i-m-os2/kernel/bare_bones.rs`), updated to the modern
//! `#[panic_handler]` attribute in place of the `#[lang = "panic_fmt"]`
//! item the teacher's older nightly relied on.

#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
#[panic_handler]
fn on_panic(info: &PanicInfo) -> ! {
    unsafe {
        crate::machine::disable_interrupts();
    }
    crate::kprintln!("\n========{{ PANIC }}========");
    crate::kprintln!("{}", info);
    crate::kprintln!("===========================");
    loop {
        unsafe {
            crate::machine::hlt();
        }
    }
}
