#![cfg_attr(target_arch = "x86", no_std, no_main)]

#[cfg(target_arch = "x86")]
mod boot {
    use core::arch::global_asm;
    use core::panic::PanicInfo;

    use ringos::arch::x86;
    use ringos::config::{MULTIBOOT_HEADER_FLAGS, MULTIBOOT_HEADER_MAGIC};
    use ringos::kernel;
    use ringos::layout::CORE_STACK;
    use x86_64::PrivilegeLevel;

    global_asm!(
        ".section .multiboot, \"a\"",
        ".balign 4",
        ".long {magic}",
        ".long {flags}",
        ".long {checksum}",
        ".text",
        ".global _start",
        "_start:",
        "cli",
        "mov ${stack}, %esp",
        "push %ebx",
        "push %eax",
        "call {main}",
        "2:",
        "hlt",
        "jmp 2b",
        magic = const MULTIBOOT_HEADER_MAGIC,
        flags = const MULTIBOOT_HEADER_FLAGS,
        checksum = const 0u32.wrapping_sub(MULTIBOOT_HEADER_MAGIC + MULTIBOOT_HEADER_FLAGS),
        stack = const CORE_STACK,
        main = sym kernel_main,
        options(att_syntax),
    );

    extern "C" fn kernel_main(magic: u32, _info: u32) -> ! {
        // SAFETY: called once from `_start`, ring 0, interrupts off.
        if let Err(e) = unsafe { kernel::early_init(magic) } {
            kernel::fatal(format_args!("INIT: {}", e));
        }
        kernel::kernel_start()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo<'_>) -> ! {
        if x86::current_ring() == PrivilegeLevel::Ring0 {
            kernel::fatal(format_args!("PANIC: {}", info))
        }
        // Outer rings cannot reach the console lock or hlt.
        x86::spin_forever()
    }
}

#[cfg(not(target_arch = "x86"))]
fn main() {}
