//! Ring 3: user tasks.
//!
//! Users cannot install descriptors of its own. Its LDT and both TSS slots
//! are DPL-3 placeholders built by ring 0, which points them at its adopted
//! copies of the users task state. The main task becomes the running task
//! once the sequencer reaches `SysReady`; it announces the system and calls
//! the nested task, which shows the prompt.

use core::ffi::CStr;

use super::tasks::{RingTasks, USERS};
use crate::config::colors;
use crate::kernel::error::TaskError;
use crate::kernel::gate::services::CoreServices;

const GREETING: &CStr = c"users: ring 3 up\n";
pub const READY: &CStr = c"SYS is ready...";
pub const READY_AT: (u8, u8) = (22, 31);
pub const PROMPT: &CStr = c"R4R<:>";

#[derive(Debug, Clone, Copy)]
pub struct UsersHooks {
    pub main_task: u32,
    pub nested_task: u32,
}

pub fn init(svc: &mut impl CoreServices, tasks: &mut RingTasks<3>, hooks: &UsersHooks) -> Result<(), TaskError> {
    tasks.build(&USERS, [hooks.main_task, hooks.nested_task])?;
    tasks.activate(svc, &USERS)?;
    svc.print(GREETING, colors::USERS, None);
    Ok(())
}

/// First thing the main task does.
pub fn announce_ready(svc: &mut impl CoreServices) {
    svc.print(READY, colors::SYS, Some(READY_AT));
    svc.print(c"\n", colors::PROMPT, None);
}

/// Body of the nested task.
pub fn show_prompt(svc: &mut impl CoreServices) {
    svc.print(PROMPT, colors::PROMPT, None);
}

#[cfg(target_arch = "x86")]
pub(crate) mod hardware {
    use spin::Mutex;

    use super::*;
    use crate::arch::x86::gates::{self, CallGates};
    use crate::arch::x86::{self, spin_forever};
    use crate::kernel::ring::ResumeToken;
    use crate::layout::TSS_USERS_TASK;

    #[link_section = ".users.data"]
    static TASKS: Mutex<RingTasks<3>> = Mutex::new(RingTasks::new());

    extern "C" fn main_task() -> ! {
        announce_ready(&mut CallGates);
        // SAFETY: installed by `users_main`; the nested task returns with iretd.
        unsafe { x86::call_task(TSS_USERS_TASK) };
        spin_forever()
    }

    extern "C" fn nested_task() -> ! {
        loop {
            show_prompt(&mut CallGates);
            // SAFETY: only ever entered from `main_task`.
            unsafe { x86::return_from_task() };
        }
    }

    pub extern "C" fn users_main(token: u32) -> ! {
        let hooks = UsersHooks {
            main_task: main_task as usize as u32,
            nested_task: nested_task as usize as u32,
        };
        let mut svc = CallGates;
        let result = init(&mut svc, &mut TASKS.lock(), &hooks);
        if result.is_err() {
            svc.print(c"users: init refused\n", colors::FAULT, None);
            spin_forever();
        }
        // first call into libs; the counter starts at 1
        if gates::libs_tx_irq() != 1 {
            svc.print(c"users: libs gate misrouted\n", colors::FAULT, None);
        }
        // SAFETY: `token` is the EAX value this ring was entered with.
        gates::resume(unsafe { ResumeToken::from_raw(token) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::COLS;
    use crate::kernel::gate::testing::Bench;
    use crate::kernel::gdt::descriptor::SystemType;
    use crate::layout::*;
    use x86_64::PrivilegeLevel::Ring3;

    const HOOKS: UsersHooks = UsersHooks {
        main_task: 0x10_3000,
        nested_task: 0x10_3100,
    };

    #[test]
    fn test_users_init_patches_placeholders() {
        let mut bench = Bench::new();
        let mut tasks = Box::new(RingTasks::<3>::new());
        let result = bench.run(Ring3, |svc| {
            let result = init(svc, &mut tasks, &HOOKS);
            announce_ready(svc);
            show_prompt(svc);
            result
        });
        assert!(result.is_ok());

        let main = bench.slot(TSS_MAIN_TASK);
        let copy = bench.tasks.tss(TSS_MAIN_TASK).unwrap();
        assert_eq!(main.system_type(), Some(SystemType::TssAvailable));
        assert_eq!(main.base(), copy.base());
        assert_eq!(main.dpl(), Ring3);
        assert_eq!(copy.eip, 0x10_3000);
        assert_eq!(copy.gs, USRS_ACCES_DATA.0);
        assert_eq!(bench.tasks.tss(TSS_USERS_TASK).unwrap().eip, 0x10_3100);

        let (row, col) = READY_AT;
        let cell = bench.cells[row as usize * COLS + col as usize];
        assert_eq!(cell as u8, b'S');
        assert_eq!(cell >> 8, crate::config::colors::SYS as u16);
        // greeting on row 0, the newline after the banner, then the prompt
        assert_eq!(bench.row_text(0), "users: ring 3 up");
        assert_eq!(bench.row_text(2), "R4R<:>");
    }
}
