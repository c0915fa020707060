//! Ring 2: shared libraries.
//!
//! Libs exports one service to users, `CG_LIBS_TX_IRQ`, and greets through
//! the devs relay rather than the core print gate. The service body runs in
//! the libs IRQ task: the gate calls the task and reports how many times it
//! has run.

use core::ffi::CStr;

use super::tasks::{RingTasks, LIBS};
use crate::kernel::error::TaskError;
use crate::kernel::gate::services::CoreServices;
use crate::layout::CG_LIBS_TX_IRQ;

pub const GREETING: &CStr = c"libs: ring 2 up\n";

#[derive(Debug, Clone, Copy)]
pub struct LibsHooks {
    pub irq_task: u32,
    pub sched_task: u32,
    pub tx_irq: u32,
}

pub fn init(svc: &mut impl CoreServices, tasks: &mut RingTasks<2>, hooks: &LibsHooks) -> Result<(), TaskError> {
    tasks.build(&LIBS, [hooks.irq_task, hooks.sched_task])?;
    tasks.activate(svc, &LIBS)?;
    svc.install_call_gate(CG_LIBS_TX_IRQ, hooks.tx_irq, 0)?;
    Ok(())
}

#[cfg(target_arch = "x86")]
pub(crate) mod hardware {
    use core::sync::atomic::{AtomicU32, Ordering};

    use spin::Mutex;

    use super::*;
    use crate::arch::x86::gates::{self, CallGates};
    use crate::arch::x86::{self, spin_forever, stubs};
    use crate::config::colors;
    use crate::kernel::ring::ResumeToken;
    use crate::layout::TSS_LIBS_IRQ;

    #[link_section = ".libs.data"]
    static TASKS: Mutex<RingTasks<2>> = Mutex::new(RingTasks::new());

    #[link_section = ".libs.data"]
    static TX_IRQ_COUNT: AtomicU32 = AtomicU32::new(0);

    extern "C" fn irq_task() -> ! {
        loop {
            TX_IRQ_COUNT.fetch_add(1, Ordering::Relaxed);
            // SAFETY: only ever entered through `tx_irq`.
            unsafe { x86::return_from_task() };
        }
    }

    extern "C" fn sched_task() -> ! {
        spin_forever()
    }

    /// `CG_LIBS_TX_IRQ` body; returns the number of calls so far.
    pub extern "C" fn tx_irq() -> u32 {
        // SAFETY: the IRQ task runs with IF clear and returns before the
        // gate does, so it is never busy here.
        unsafe { x86::call_task(TSS_LIBS_IRQ) };
        TX_IRQ_COUNT.load(Ordering::Relaxed)
    }

    pub extern "C" fn libs_main(token: u32) -> ! {
        let hooks = LibsHooks {
            irq_task: irq_task as usize as u32,
            sched_task: sched_task as usize as u32,
            tx_irq: stubs::address(stubs::libs_tx_irq_entry),
        };
        let mut svc = CallGates;
        let result = init(&mut svc, &mut TASKS.lock(), &hooks);
        if result.is_err() {
            svc.print(c"libs: init refused\n", colors::FAULT, None);
            spin_forever();
        }
        gates::devs_tty_write(GREETING, colors::LIBS);
        // SAFETY: `token` is the EAX value this ring was entered with.
        gates::resume(unsafe { ResumeToken::from_raw(token) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::gate::testing::Bench;
    use crate::layout::*;
    use x86_64::PrivilegeLevel::{Ring2, Ring3};

    const HOOKS: LibsHooks = LibsHooks {
        irq_task: 0x10_2000,
        sched_task: 0x10_2100,
        tx_irq: 0x10_2200,
    };

    #[test]
    fn test_libs_init_binds_service_gate() {
        let mut bench = Bench::new();
        let mut tasks = Box::new(RingTasks::<2>::new());
        assert!(bench.run(Ring2, |svc| init(svc, &mut tasks, &HOOKS)).is_ok());

        let gate = bench.slot(CG_LIBS_TX_IRQ);
        assert_eq!(gate.gate_offset(), 0x10_2200);
        assert_eq!(gate.gate_selector(), LIBS_CODE);
        assert_eq!(gate.dpl(), Ring3);

        let irq = bench.tasks.tss(TSS_LIBS_IRQ).unwrap();
        assert_eq!(bench.slot(TSS_LIBS_IRQ).base(), irq.base());
        assert_eq!(irq.eip, 0x10_2000);
        assert_eq!(irq.ring1_ss, DEVS_DATA.0);
        assert_eq!(irq.cs, LIBS_LDT_CODE.0);
        assert_eq!(bench.slot(TSS_LIBS_SCHED).base(), bench.tasks.tss(TSS_LIBS_SCHED).unwrap().base());
    }

    #[test]
    fn test_libs_cannot_rebind_devs_relay_target() {
        let mut bench = Bench::new();
        assert!(bench.run(Ring2, |svc| svc.install_call_gate(CG_DEVS_TTY_W, 0x6666, 0)).is_err());
    }
}
