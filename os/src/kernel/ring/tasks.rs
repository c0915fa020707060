//! Per-ring LDT and TSS sets for rings 1..3.
//!
//! Each outer ring owns one LDT and two tasks. A task carries a stack for
//! every ring more privileged than its own, so `INNER` equals the ring
//! number. Tasks run on the ring's LDT segments. The LDT and TSSs are handed
//! to ring 0 through `CG_GDT_SET`, which adopts checked copies and stamps the
//! kernel page directory into them; LDTR and TR for these tasks are loaded by
//! the hardware task switch.

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel::{Ring1, Ring2, Ring3};

use super::stack::TaskStacks;
use crate::kernel::error::TaskError;
use crate::kernel::gate::services::CoreServices;
use crate::kernel::gdt::ldt::Ldt;
use crate::kernel::gdt::tss::{build_tss, TaskContext, TaskLayout, TaskRole, Tss32};
use crate::layout::*;

#[derive(Debug, Clone, Copy)]
pub struct RingProfile {
    pub layout: TaskLayout,
    /// Page limit of the ring's local code/data segments.
    pub limit: u32,
    pub tasks: [(SegmentSelector, TaskRole); 2],
}

pub const DEVS: RingProfile = RingProfile {
    layout: TaskLayout {
        ring: Ring1,
        iopl: Ring1,
        code: DEVS_LDT_CODE,
        data: DEVS_LDT_DATA,
        gs: DEVS_ACCES_DATA,
        ldt: LDT_DEVS,
    },
    limit: DEVS_LIMIT,
    tasks: [(TSS_DEVS_IRQ, TaskRole::Irq), (TSS_DEVS_SCHED, TaskRole::Sched)],
};

pub const LIBS: RingProfile = RingProfile {
    layout: TaskLayout {
        ring: Ring2,
        iopl: Ring2,
        code: LIBS_LDT_CODE,
        data: LIBS_LDT_DATA,
        gs: LIBS_LDT_DATA,
        ldt: LDT_LIBS,
    },
    limit: LIBS_LIMIT,
    tasks: [(TSS_LIBS_IRQ, TaskRole::Irq), (TSS_LIBS_SCHED, TaskRole::Sched)],
};

pub const USERS: RingProfile = RingProfile {
    layout: TaskLayout {
        ring: Ring3,
        iopl: Ring3,
        code: USERS_LDT_CODE,
        data: USERS_LDT_DATA,
        gs: USRS_ACCES_DATA,
        ldt: LDT_USERS,
    },
    limit: USERS_SYS_LIMIT,
    tasks: [(TSS_MAIN_TASK, TaskRole::Main), (TSS_USERS_TASK, TaskRole::Nested)],
};

#[repr(C)]
pub struct RingTasks<const INNER: usize> {
    pub ldt: Ldt,
    pub tss: [Tss32; 2],
    pub stacks: [TaskStacks<INNER>; 2],
}

impl<const INNER: usize> RingTasks<INNER> {
    pub const fn new() -> Self {
        Self {
            ldt: Ldt::empty(),
            tss: [Tss32::zeroed(); 2],
            stacks: [TaskStacks::new(), TaskStacks::new()],
        }
    }

    /// Fills the LDT and both TSSs. `entries` are the task entry points in
    /// `profile.tasks` order. CR3 is left for ring 0 to fill in.
    pub fn build(&mut self, profile: &RingProfile, entries: [u32; 2]) -> Result<(), TaskError> {
        self.ldt = Ldt::for_ring(profile.layout.ring, profile.limit);

        for (i, (_, role)) in profile.tasks.iter().enumerate() {
            let stacks = &self.stacks[i];
            let ctx = TaskContext {
                entry: entries[i],
                stack_top: stacks.task.top(),
                cr3: 0,
            };
            self.tss[i] = build_tss(&profile.layout, *role, ctx, &stacks.inner_tops())?;
        }
        Ok(())
    }

    /// Hands the LDT, then both TSSs, to ring 0. The LDT goes first so the
    /// task selectors resolve when the TSSs are checked.
    pub fn activate(&self, svc: &mut impl CoreServices, profile: &RingProfile) -> Result<(), TaskError> {
        svc.install_ldt(profile.layout.ldt, &self.ldt)?;
        for ((selector, _), tss) in profile.tasks.iter().zip(&self.tss) {
            svc.install_tss(*selector, tss)?;
        }
        Ok(())
    }
}

impl<const INNER: usize> Default for RingTasks<INNER> {
    fn default() -> Self {
        Self::new()
    }
}
