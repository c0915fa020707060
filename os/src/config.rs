//! Build-time tunables.

use log::LevelFilter;

/// Serial log verbosity.
pub const LOG_LEVEL: LevelFilter = if cfg!(debug_assertions) {
    LevelFilter::Debug
} else {
    LevelFilter::Info
};

/// Words per task stack (one per TSS role and inner ring).
pub const TASK_STACK_WORDS: usize = 0x100;

/// Longest NUL-terminated message the print gate will scan.
pub const MAX_PRINT_LEN: usize = 80 * 25;

/// Multiboot v1 header magic.
pub const MULTIBOOT_HEADER_MAGIC: u32 = 0x1BAD_B002;

/// Page-align modules, request the memory map.
pub const MULTIBOOT_HEADER_FLAGS: u32 = 0x0000_0003;

/// Multiboot v1 handoff value in EAX.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

pub mod colors {
    use crate::console::attr;
    use crate::console::Color::*;

    pub const DEFAULT: u8 = attr(Green, Black);
    pub const FAULT: u8 = attr(Red, Black);
    pub const BANNER: u8 = attr(White, Black);
    pub const DEVS: u8 = attr(Yellow, Black);
    pub const LIBS: u8 = attr(LightCyan, Black);
    pub const USERS: u8 = attr(LightBlue, Black);
    pub const LOGO: u8 = attr(White, Black);
    pub const PROMPT: u8 = attr(Green, Black);
    pub const SYS: u8 = attr(Black, Green);
}
