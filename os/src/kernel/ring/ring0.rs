//! Ring-0 task setup and the core gates.
//!
//! Core owns one TSS and one LDT. The TSS names the inner stacks used
//! whenever an outer ring calls a gate while no task switch has happened yet,
//! so it carries stacks for rings 0, 1 and 2.

use core::ffi::CStr;

use x86_64::PrivilegeLevel::Ring0;

use super::BootStage;
use crate::config::colors;
use crate::kernel::error::TaskError;
use crate::kernel::gate::services::CoreServices;
use crate::kernel::gdt::ldt::Ldt;
use crate::kernel::gdt::tss::{build_tss, TaskContext, TaskLayout, TaskRole, Tss32};
use crate::layout::*;

pub const LAYOUT: TaskLayout = TaskLayout {
    ring: Ring0,
    iopl: Ring0,
    code: CORE_CODE,
    data: CORE_DATA,
    gs: CORE_DATA,
    ldt: LDT_CORE,
};

const GREETING: &CStr = c"core: GDT, IDT and paging up\n";

/// Addresses of the ring-0 gate stubs.
#[derive(Debug, Clone, Copy)]
pub struct CoreGates {
    pub gdt_set: u32,
    pub idt_set: u32,
    pub printr: u32,
    pub tx_irq: u32,
    pub resume: u32,
}

#[repr(C)]
pub struct CoreTask {
    pub tss: Tss32,
    pub ldt: Ldt,
}

impl CoreTask {
    pub const fn new() -> Self {
        Self {
            tss: Tss32::zeroed(),
            ldt: Ldt::empty(),
        }
    }

    pub fn build(&mut self, cr3: u32) -> Result<(), TaskError> {
        self.ldt = Ldt::for_ring(Ring0, MEM_LIMIT);
        let ctx = TaskContext {
            entry: 0,
            stack_top: CORE_STACK,
            cr3,
        };
        self.tss = build_tss(
            &LAYOUT,
            TaskRole::Main,
            ctx,
            &[CORE_STACK, DEVS_STACK, LIBS_STACK],
        )?;
        Ok(())
    }
}

impl Default for CoreTask {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the core task, patches its placeholders and binds the core gates.
///
/// The gates take their arguments in registers, so every one of them is
/// patched to a zero parameter count.
pub fn setup(
    svc: &mut impl CoreServices,
    task: &mut CoreTask,
    gates: &CoreGates,
    cr3: u32,
) -> Result<(), TaskError> {
    task.build(cr3)?;
    svc.install_tss(TSS_CORE, &task.tss)?;
    svc.install_ldt(LDT_CORE, &task.ldt)?;

    for (selector, handler) in [
        (CG_GDT_SET, gates.gdt_set),
        (CG_IDT_SET, gates.idt_set),
        (CG_CORE_PRINTR, gates.printr),
        (CG_CORE_TX_IRQ, gates.tx_irq),
        (CG_CORE_RESUME, gates.resume),
    ] {
        svc.install_call_gate(selector, handler, 0)?;
    }

    svc.print(GREETING, colors::BANNER, None);
    Ok(())
}

pub fn after_ring(stage: BootStage) {
    log::info!("{:?} ring initialised", stage);
}

#[cfg(target_arch = "x86")]
pub(crate) mod hardware {
    use spin::Mutex;
    use x86_64::PrivilegeLevel::Ring0;

    use super::*;
    use crate::arch::x86::{self, stubs};
    use crate::kernel::gate::adopt::{self, RingRegions};
    use crate::kernel::gate::services::DirectCore;
    use crate::kernel::{gdt, idt};

    static CORE_TASK: Mutex<CoreTask> = Mutex::new(CoreTask::new());

    fn gates() -> CoreGates {
        CoreGates {
            gdt_set: stubs::address(stubs::cg_gdt_set_entry),
            idt_set: stubs::address(stubs::cg_idt_set_entry),
            printr: stubs::address(stubs::cg_core_printr_entry),
            tx_irq: stubs::address(stubs::cg_core_tx_irq_entry),
            resume: stubs::address(stubs::cg_core_resume_entry),
        }
    }

    /// Sets up the core task and loads LDTR and TR. Every task adopted from
    /// an outer ring later runs with the same page directory.
    pub fn init() -> Result<(), TaskError> {
        // SAFETY: ring 0 during boot, interrupts disabled, no other view.
        let mut gdt = unsafe { gdt::system_table() };
        let mut idt = unsafe { idt::system_table() };
        let mut task = CORE_TASK.lock();
        let mut store = adopt::hardware::TASK_STORE.lock();
        let directory = crate::paging::directory_address();
        store.set_directory(directory);

        crate::console::with_console(|console| {
            let mut core = DirectCore::new(&mut gdt, &mut idt, console, &mut store, &RingRegions, Ring0);
            setup(&mut core, &mut task, &gates(), directory)
        })?;
        drop(store);

        // SAFETY: both descriptors were just patched to point at CORE_TASK.
        unsafe {
            x86::load_ldt(LDT_CORE);
            x86::load_task_register(TSS_CORE);
        }
        log::info!("core task loaded, tss at {:#x}", task.tss.base());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::gate::testing::Bench;
    use crate::kernel::gdt::descriptor::SystemType;
    use x86_64::PrivilegeLevel::Ring3;

    const GATES: CoreGates = CoreGates {
        gdt_set: 0x10_0100,
        idt_set: 0x10_0200,
        printr: 0x10_0300,
        tx_irq: 0x10_0400,
        resume: 0x10_0500,
    };

    #[test]
    fn test_core_setup_binds_gates_and_task() {
        let mut bench = Bench::new();
        let mut task = Box::new(CoreTask::new());
        let result = bench.run(Ring0, |core| setup(core, &mut task, &GATES, 0x0020_0000));
        assert!(result.is_ok());

        let tss = bench.slot(TSS_CORE);
        assert_eq!(tss.system_type(), Some(SystemType::TssAvailable));
        assert_eq!(tss.base(), task.tss.base());
        assert_eq!(tss.dpl(), Ring0);
        assert_eq!(bench.slot(LDT_CORE).base(), task.ldt.base());

        let printr = bench.slot(CG_CORE_PRINTR);
        assert_eq!(printr.gate_offset(), GATES.printr);
        assert_eq!(printr.param_count(), 0);
        assert_eq!(printr.gate_selector(), CORE_CODE);
        assert_eq!(printr.dpl(), Ring3);
        assert_eq!(bench.slot(CG_CORE_RESUME).gate_offset(), GATES.resume);
        assert!(bench.row_text(0).starts_with("core:"));
    }

    #[test]
    fn test_core_setup_is_ring0_only() {
        let mut bench = Bench::new();
        let mut task = Box::new(CoreTask::new());
        let result = bench.run(Ring3, |core| setup(core, &mut task, &GATES, 0x0020_0000));
        assert!(matches!(result, Err(TaskError::Install(_))));
        assert_eq!(bench.slot(TSS_CORE).base(), 0);
    }

    #[test]
    fn test_core_tss_inner_stacks() {
        let mut task = CoreTask::new();
        task.build(0x0020_0000).unwrap();
        assert_eq!(task.tss.ring0_stack, CORE_STACK);
        assert_eq!(task.tss.ring1_stack, DEVS_STACK);
        assert_eq!(task.tss.ring1_ss, DEVS_DATA.0);
        assert_eq!(task.tss.ring2_stack, LIBS_STACK);
        assert_eq!(task.tss.cr3, 0x0020_0000);
        assert_eq!(task.tss.ldt, LDT_CORE.0);
    }
}
