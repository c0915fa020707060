//! Architecture shims. Everything that needs inline assembly lives here.

#[cfg(target_arch = "x86")]
pub mod x86;
