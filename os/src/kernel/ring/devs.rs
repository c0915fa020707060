//! Ring 1: device drivers.
//!
//! Devs registers its tasks, the `CG_DEVS_TTY_W` relay that lets libs print
//! and the keyboard interrupt at vector 0x21. The interrupt stub only records
//! the IRQ line and calls the devs IRQ task, which runs the bottom half from
//! [`IrqTable`] and returns to the interrupted task.

use core::ffi::CStr;

use x86_64::PrivilegeLevel::Ring1;

use super::tasks::{RingTasks, DEVS};
use crate::config::colors;
use crate::kernel::error::TaskError;
use crate::kernel::gate::services::CoreServices;
use crate::kernel::idt::KEY_INT;
use crate::layout::CG_DEVS_TTY_W;

const GREETING: &CStr = c"devs: ring 1 up, keyboard on IRQ1\n";

/// Lines of the two cascaded PICs.
pub const IRQ_LINES: usize = 16;

/// Pending-line value when no interrupt is waiting.
pub const NO_IRQ: u32 = u32::MAX;

/// Bottom halves run by the devs IRQ task, by PIC line.
#[derive(Clone, Copy)]
pub struct IrqTable([Option<fn()>; IRQ_LINES]);

impl IrqTable {
    pub const fn new() -> Self {
        Self([None; IRQ_LINES])
    }

    pub const fn with(self, line: u8, handler: fn()) -> Self {
        let mut lines = self.0;
        lines[line as usize] = Some(handler);
        Self(lines)
    }

    /// Runs the handler of `line`; false for [`NO_IRQ`] and unbound lines.
    pub fn dispatch(&self, line: u32) -> bool {
        match self.0.get(line as usize).copied().flatten() {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Addresses this ring hands to ring 0.
#[derive(Debug, Clone, Copy)]
pub struct DevsHooks {
    pub irq_task: u32,
    pub sched_task: u32,
    pub tty_write: u32,
    pub keyboard: u32,
}

pub fn init(svc: &mut impl CoreServices, tasks: &mut RingTasks<1>, hooks: &DevsHooks) -> Result<(), TaskError> {
    tasks.build(&DEVS, [hooks.irq_task, hooks.sched_task])?;
    tasks.activate(svc, &DEVS)?;
    svc.install_call_gate(CG_DEVS_TTY_W, hooks.tty_write, 0)?;
    svc.install_interrupt(KEY_INT, hooks.keyboard, Ring1)?;
    svc.print(GREETING, colors::DEVS, None);
    Ok(())
}

#[cfg(target_arch = "x86")]
pub(crate) mod hardware {
    use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

    use spin::Mutex;

    use super::*;
    use crate::arch::x86::gates::{self, CallGates};
    use crate::arch::x86::{self, port, spin_forever, stubs};
    use crate::kernel::ring::ResumeToken;
    use crate::layout::TSS_DEVS_IRQ;
    use crate::{keyboard, pic};

    #[link_section = ".devs.data"]
    static TASKS: Mutex<RingTasks<1>> = Mutex::new(RingTasks::new());

    #[link_section = ".devs.data"]
    static PENDING_IRQ: AtomicU32 = AtomicU32::new(NO_IRQ);

    /// Last key typed, 0 when none.
    #[link_section = ".devs.data"]
    pub static KEY_MAILBOX: AtomicU8 = AtomicU8::new(0);

    const HANDLERS: IrqTable = IrqTable::new().with(pic::KEYBOARD_IRQ, keyboard_interrupt);

    extern "C" fn irq_task() -> ! {
        loop {
            HANDLERS.dispatch(PENDING_IRQ.swap(NO_IRQ, Ordering::Relaxed));
            // SAFETY: only ever entered through `raise_irq`.
            unsafe { x86::return_from_task() };
        }
    }

    extern "C" fn sched_task() -> ! {
        spin_forever()
    }

    /// Called by the IRQ stubs on the ring-1 stack of the interrupted task.
    pub extern "C" fn raise_irq(line: u32) {
        PENDING_IRQ.store(line, Ordering::Relaxed);
        // SAFETY: the IRQ task is installed before any line is unmasked, and
        // runs with IF clear, so it is never busy here.
        unsafe { x86::call_task(TSS_DEVS_IRQ) };
    }

    pub extern "C" fn devs_main(token: u32) -> ! {
        let hooks = DevsHooks {
            irq_task: irq_task as usize as u32,
            sched_task: sched_task as usize as u32,
            tty_write: stubs::address(stubs::devs_tty_write_entry),
            keyboard: stubs::address(stubs::devs_keyboard_entry),
        };
        let mut svc = CallGates;
        let result = init(&mut svc, &mut TASKS.lock(), &hooks);
        if result.is_err() {
            // without the resume the boot stops here
            svc.print(c"devs: init refused\n", colors::FAULT, None);
            spin_forever();
        }
        // SAFETY: `token` is the EAX value this ring was entered with.
        gates::resume(unsafe { ResumeToken::from_raw(token) })
    }

    fn keyboard_interrupt() {
        // SAFETY: the IRQ task runs with IOPL 1.
        let scancode = unsafe { port::inb(keyboard::DATA_PORT) };
        if let Some(key) = keyboard::translate(scancode) {
            KEY_MAILBOX.store(key, Ordering::Relaxed);
            let echo = [key, 0];
            if let Ok(text) = CStr::from_bytes_with_nul(&echo) {
                CallGates.print(text, colors::PROMPT, None);
            }
        }
        // SAFETY: as above.
        unsafe { pic::end_of_interrupt(pic::KEYBOARD_IRQ) };
    }
}
