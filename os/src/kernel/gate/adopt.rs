//! Task state adopted from outer rings
//!
//! Rings 1..3 build their LDT and TSSs in their own memory, but the CPU trusts
//! every field of a TSS it switches to: inner-ring stacks, CR3, EFLAGS and the
//! LDT selector. An outer ring therefore never gets a GDT slot that points at
//! its own memory. Ring 0 copies the handed-over state into a [`TaskStore`]
//! in the core region, checks it against the caller's ring and patches the
//! placeholder to the copy.
//!
//! Ring 0 itself keeps exact base/limit patching for its own slots.

use x86_64::registers::rflags::RFlags;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel::{self, Ring0, Ring1, Ring2, Ring3};

use crate::kernel::error::{GateError, GateResult};
use crate::kernel::gdt::descriptor::{Access, Descriptor};
use crate::kernel::gdt::ldt::{Ldt, LDT_ENTRIES, LDT_LIMIT};
use crate::kernel::gdt::tss::{Tss32, TSS_LIMIT};
use crate::kernel::gdt::DescriptorTable;
use crate::layout::*;

/// TSS slots outer rings hand task state to, with the ring that owns each.
pub const ADOPTED_TSS: [(SegmentSelector, PrivilegeLevel); 6] = [
    (TSS_DEVS_IRQ, Ring1),
    (TSS_DEVS_SCHED, Ring1),
    (TSS_LIBS_IRQ, Ring2),
    (TSS_LIBS_SCHED, Ring2),
    (TSS_MAIN_TASK, Ring3),
    (TSS_USERS_TASK, Ring3),
];

pub const ADOPTED_LDT: [(SegmentSelector, PrivilegeLevel); 3] =
    [(LDT_DEVS, Ring1), (LDT_LIBS, Ring2), (LDT_USERS, Ring3)];

/// Room an inner stack needs below its top: a far-call or interrupt frame
/// from an outer ring (SS, ESP, EFLAGS, CS, EIP, error code) plus slack.
pub const INNER_FRAME: u32 = 32;

const EFLAGS_ALLOWED: u32 = (RFlags::INTERRUPT_FLAG.bits()
    | RFlags::IOPL_LOW.bits()
    | RFlags::IOPL_HIGH.bits()) as u32
    | 1 << 1;

/// Where the dispatcher reads handed-over task state from.
pub trait CallerMemory {
    /// Whether `addr..addr + len` is memory private to `ring`.
    fn owns(&self, ring: PrivilegeLevel, addr: u32, len: u32) -> bool;

    fn read_tss(&self, addr: u32) -> Option<Tss32>;

    fn read_ldt(&self, addr: u32) -> Option<Ldt>;
}

/// Copies of every outer-ring TSS and LDT, in ring-0 memory.
pub struct TaskStore {
    tss: [Tss32; ADOPTED_TSS.len()],
    ldt: [Ldt; ADOPTED_LDT.len()],
    directory: u32,
}

fn slot_of(
    slots: &[(SegmentSelector, PrivilegeLevel)],
    selector: SegmentSelector,
) -> Option<(usize, PrivilegeLevel)> {
    slots
        .iter()
        .position(|(s, _)| s.index() == selector.index())
        .map(|i| (i, slots[i].1))
}

fn refuse(why: &'static str) -> GateError {
    GateError::BadTaskState(why)
}

/// Expand-up segment of `caller` ending within its reach.
pub fn check_segment_reach(caller: PrivilegeLevel, segment: Descriptor) -> GateResult<()> {
    if segment.is_expand_down() || segment.end() > reach(caller) as u64 {
        return Err(GateError::OutOfReach(segment.base()));
    }
    Ok(())
}

impl TaskStore {
    pub const fn new() -> Self {
        Self {
            tss: [Tss32::zeroed(); ADOPTED_TSS.len()],
            ldt: [Ldt::empty(); ADOPTED_LDT.len()],
            directory: 0,
        }
    }

    /// Page directory every adopted task runs with.
    pub fn set_directory(&mut self, cr3: u32) {
        self.directory = cr3;
    }

    pub fn tss(&self, selector: SegmentSelector) -> Option<&Tss32> {
        slot_of(&ADOPTED_TSS, selector).map(|(i, _)| &self.tss[i])
    }

    pub fn ldt(&self, selector: SegmentSelector) -> Option<&Ldt> {
        slot_of(&ADOPTED_LDT, selector).map(|(i, _)| &self.ldt[i])
    }

    /// Copies `ldt` for `ring` and returns the base of the copy.
    ///
    /// Entries past `limit` are cleared. Every remaining entry must be null or
    /// a present expand-up code/data segment of `ring` within its reach.
    pub fn adopt_ldt(
        &mut self,
        ring: PrivilegeLevel,
        selector: SegmentSelector,
        ldt: &Ldt,
        limit: u32,
    ) -> GateResult<u32> {
        let (slot, owner) = slot_of(&ADOPTED_LDT, selector).ok_or(refuse("slot holds no ring LDT"))?;
        if owner != ring {
            return Err(GateError::PrivilegeViolation {
                caller: ring,
                required: owner,
            });
        }
        if limit > LDT_LIMIT || (limit + 1) % 8 != 0 {
            return Err(GateError::BadArgument(limit));
        }

        let used = (limit as usize + 1) / 8;
        let mut entries = [Descriptor::NULL; LDT_ENTRIES];
        for (i, entry) in ldt.entries().iter().take(used).enumerate() {
            if entry.is_null() {
                continue;
            }
            if !entry.is_present() || !entry.access().contains(Access::CODE_DATA) {
                return Err(GateError::SystemDescriptor(entry.access().bits()));
            }
            if entry.dpl() != ring {
                return Err(GateError::PrivilegeViolation {
                    caller: ring,
                    required: entry.dpl(),
                });
            }
            check_segment_reach(ring, *entry)?;
            entries[i] = *entry;
        }

        self.ldt[slot] = Ldt::from_entries(entries);
        Ok(self.ldt[slot].base())
    }

    /// Copies `tss` for `ring`, stamps the kernel page directory into it and
    /// returns the base of the copy.
    pub fn adopt_tss(
        &mut self,
        gdt: &DescriptorTable<'_>,
        memory: &dyn CallerMemory,
        ring: PrivilegeLevel,
        selector: SegmentSelector,
        tss: &Tss32,
    ) -> GateResult<u32> {
        let (slot, owner) = slot_of(&ADOPTED_TSS, selector).ok_or(refuse("slot holds no ring task"))?;
        if owner != ring {
            return Err(GateError::PrivilegeViolation {
                caller: ring,
                required: owner,
            });
        }
        self.check_tss(gdt, memory, ring, tss)?;

        let mut copy = *tss;
        copy.cr3 = self.directory;
        self.tss[slot] = copy;
        Ok(self.tss[slot].base())
    }

    fn check_tss(
        &self,
        gdt: &DescriptorTable<'_>,
        memory: &dyn CallerMemory,
        ring: PrivilegeLevel,
        tss: &Tss32,
    ) -> GateResult<()> {
        if tss.back_link != 0 {
            return Err(refuse("back link set"));
        }
        if tss.eflags & !EFLAGS_ALLOWED != 0 {
            return Err(refuse("eflags beyond IF and IOPL"));
        }
        if (tss.eflags >> 12) & 3 > ring as u32 {
            return Err(refuse("IOPL above the task ring"));
        }
        if tss.io_map_base as u32 <= TSS_LIMIT {
            return Err(refuse("I/O bitmap inside the TSS"));
        }
        if tss.ldt != ldt_selector_for(ring).0 {
            return Err(refuse("LDT of another ring"));
        }

        self.check_selector(gdt, ring, tss.cs, Kind::Code)?;
        self.check_selector(gdt, ring, tss.ss, Kind::Stack)?;
        for selector in [tss.ds, tss.es, tss.fs, tss.gs] {
            self.check_selector(gdt, ring, selector, Kind::Data)?;
        }

        let inner = [
            (tss.ring0_stack, tss.ring0_ss),
            (tss.ring1_stack, tss.ring1_ss),
            (tss.ring2_stack, tss.ring2_ss),
        ];
        for (level, (esp, ss)) in inner.into_iter().take(ring as usize).enumerate() {
            if ss != data_selector_for(crate::kernel::gdt::descriptor::ring(level as u8)).0 {
                return Err(refuse("inner stack segment"));
            }
            let owned = esp
                .checked_sub(INNER_FRAME)
                .is_some_and(|low| memory.owns(ring, low, INNER_FRAME));
            if !owned {
                return Err(GateError::OutOfReach(esp));
            }
        }
        Ok(())
    }

    fn resolve(&self, gdt: &DescriptorTable<'_>, ring: PrivilegeLevel, selector: u16) -> Option<Descriptor> {
        let selector = SegmentSelector(selector);
        if selector.0 & 0b100 == 0 {
            return gdt.read_at(selector).ok();
        }
        self.ldt(ldt_selector_for(ring))?
            .entries()
            .get(selector.index() as usize)
            .copied()
    }

    fn check_selector(
        &self,
        gdt: &DescriptorTable<'_>,
        ring: PrivilegeLevel,
        selector: u16,
        kind: Kind,
    ) -> GateResult<()> {
        if kind == Kind::Data && selector & !3 == 0 {
            return Ok(());
        }
        if selector & 3 != ring as u16 {
            return Err(refuse("selector RPL differs from the task ring"));
        }
        let segment = self
            .resolve(gdt, ring, selector)
            .filter(|d| d.is_present() && d.dpl() == ring)
            .ok_or(refuse("selector names no segment of the task ring"))?;
        let fits = match kind {
            Kind::Code => segment.is_code_segment() && !segment.access().contains(Access::CONFORMING),
            Kind::Stack => segment.is_data_segment() && segment.access().contains(Access::READ_WRITE),
            Kind::Data => segment.is_data_segment(),
        };
        if fits {
            Ok(())
        } else {
            Err(refuse("segment type does not fit its register"))
        }
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Code,
    Stack,
    Data,
}

/// Outer-ring memory as laid out in [`crate::layout`]: each ring owns its
/// 64 KiB region and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingRegions;

#[cfg(target_arch = "x86")]
impl CallerMemory for RingRegions {
    fn owns(&self, ring: PrivilegeLevel, addr: u32, len: u32) -> bool {
        ring != Ring0 && in_region(ring, addr, len)
    }

    fn read_tss(&self, addr: u32) -> Option<Tss32> {
        // SAFETY: the dispatcher checked the range with `owns`; every segment
        // has base 0 and the pool is identity mapped.
        Some(unsafe { core::ptr::read_unaligned(addr as usize as *const Tss32) })
    }

    fn read_ldt(&self, addr: u32) -> Option<Ldt> {
        // SAFETY: as above.
        Some(unsafe { core::ptr::read_unaligned(addr as usize as *const Ldt) })
    }
}

#[cfg(target_arch = "x86")]
pub(crate) mod hardware {
    use spin::Mutex;

    use super::TaskStore;

    /// Adopted task state. Locked by ring 0 only, with interrupts disabled.
    pub static TASK_STORE: Mutex<TaskStore> = Mutex::new(TaskStore::new());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::gdt::build_system_table;
    use crate::kernel::gate::testing::Staged;
    use crate::kernel::gdt::tss::{build_tss, TaskContext, TaskLayout, TaskRole};

    const USERS_LAYOUT: TaskLayout = TaskLayout {
        ring: Ring3,
        iopl: Ring3,
        code: USERS_LDT_CODE,
        data: USERS_LDT_DATA,
        gs: USRS_ACCES_DATA,
        ldt: LDT_USERS,
    };

    const DEVS_LAYOUT: TaskLayout = TaskLayout {
        ring: Ring1,
        iopl: Ring1,
        code: DEVS_LDT_CODE,
        data: DEVS_LDT_DATA,
        gs: DEVS_ACCES_DATA,
        ldt: LDT_DEVS,
    };

    fn users_tss() -> Tss32 {
        let ctx = TaskContext {
            entry: 0x0010_3000,
            stack_top: USERS_START + 0x400,
            cr3: 0,
        };
        let inner = [USERS_START + 0x800, USERS_START + 0xC00, USERS_START + 0x1000];
        build_tss(&USERS_LAYOUT, TaskRole::Main, ctx, &inner).unwrap()
    }

    fn devs_irq_tss() -> Tss32 {
        let ctx = TaskContext {
            entry: 0x0010_1000,
            stack_top: DEVS_START + 0x400,
            cr3: 0,
        };
        build_tss(&DEVS_LAYOUT, TaskRole::Irq, ctx, &[DEVS_START + 0x800]).unwrap()
    }

    fn with_store(f: impl FnOnce(&mut TaskStore, &DescriptorTable<'_>)) {
        let mut slots = vec![Descriptor::NULL; GDT_ENTRIES];
        let mut gdt = DescriptorTable::new(&mut slots);
        build_system_table(&mut gdt).unwrap();
        let mut store = Box::new(TaskStore::new());
        store.set_directory(0x0012_3000);
        for (selector, ring) in ADOPTED_LDT {
            let limit = match ring {
                Ring1 => DEVS_LIMIT,
                Ring2 => LIBS_LIMIT,
                _ => USERS_SYS_LIMIT,
            };
            store.adopt_ldt(ring, selector, &Ldt::for_ring(ring, limit), LDT_LIMIT).unwrap();
        }
        f(&mut store, &gdt);
    }

    fn staged(ring: PrivilegeLevel) -> Staged {
        Staged::new(ring)
    }

    #[test]
    fn test_adopted_copy_lives_in_the_store() {
        with_store(|store, gdt| {
            let tss = users_tss();
            let base = store
                .adopt_tss(gdt, &staged(Ring3), Ring3, TSS_MAIN_TASK, &tss)
                .unwrap();
            let copy = store.tss(TSS_MAIN_TASK).unwrap();
            assert_eq!(base, copy.base());
            assert_eq!(copy.cr3, 0x0012_3000);
            assert_eq!(copy.eip, tss.eip);
            assert_eq!(copy.cs, USERS_LDT_CODE.0);
        });
    }

    #[test]
    fn test_nested_or_linked_task_is_refused() {
        with_store(|store, gdt| {
            let mut nested = devs_irq_tss();
            nested.eflags |= RFlags::NESTED_TASK.bits() as u32;
            assert!(matches!(
                store.adopt_tss(gdt, &staged(Ring1), Ring1, TSS_DEVS_IRQ, &nested),
                Err(GateError::BadTaskState(_))
            ));

            let mut linked = devs_irq_tss();
            linked.back_link = TSS_CORE.0;
            assert!(matches!(
                store.adopt_tss(gdt, &staged(Ring1), Ring1, TSS_DEVS_IRQ, &linked),
                Err(GateError::BadTaskState(_))
            ));
            assert_eq!(store.tss(TSS_DEVS_IRQ).unwrap().eip, 0);
        });
    }

    #[test]
    fn test_inner_stack_must_stay_in_the_ring_region() {
        with_store(|store, gdt| {
            // ring 0 would push its frames into core data
            let mut tss = users_tss();
            tss.ring0_stack = CORE_STACK;
            assert_eq!(
                store.adopt_tss(gdt, &staged(Ring3), Ring3, TSS_MAIN_TASK, &tss),
                Err(GateError::OutOfReach(CORE_STACK))
            );

            let mut tss = users_tss();
            tss.ring1_ss = CORE_DATA.0;
            assert!(store.adopt_tss(gdt, &staged(Ring3), Ring3, TSS_MAIN_TASK, &tss).is_err());
        });
    }

    #[test]
    fn test_segment_registers_must_belong_to_the_ring() {
        with_store(|store, gdt| {
            let mut tss = users_tss();
            tss.cs = CORE_CODE.0;
            assert!(store.adopt_tss(gdt, &staged(Ring3), Ring3, TSS_MAIN_TASK, &tss).is_err());

            let mut tss = users_tss();
            tss.ds = DEVS_ACCES_DATA.0;
            assert!(store.adopt_tss(gdt, &staged(Ring3), Ring3, TSS_MAIN_TASK, &tss).is_err());

            let mut tss = users_tss();
            tss.ldt = LDT_CORE.0;
            assert!(store.adopt_tss(gdt, &staged(Ring3), Ring3, TSS_MAIN_TASK, &tss).is_err());

            let mut tss = users_tss();
            tss.fs = NULL_SELECTOR.0;
            assert!(store.adopt_tss(gdt, &staged(Ring3), Ring3, TSS_MAIN_TASK, &tss).is_ok());
        });
    }

    #[test]
    fn test_io_map_and_iopl_limits() {
        with_store(|store, gdt| {
            let mut tss = devs_irq_tss();
            tss.io_map_base = 0x40;
            assert!(store.adopt_tss(gdt, &staged(Ring1), Ring1, TSS_DEVS_IRQ, &tss).is_err());

            let mut tss = devs_irq_tss();
            tss.eflags |= RFlags::IOPL_HIGH.bits() as u32;
            assert!(store.adopt_tss(gdt, &staged(Ring1), Ring1, TSS_DEVS_IRQ, &tss).is_err());
        });
    }

    #[test]
    fn test_ring_adopts_only_its_own_slots() {
        with_store(|store, gdt| {
            let tss = devs_irq_tss();
            assert_eq!(
                store.adopt_tss(gdt, &staged(Ring1), Ring1, TSS_MAIN_TASK, &tss),
                Err(GateError::PrivilegeViolation {
                    caller: Ring1,
                    required: Ring3
                })
            );
            assert!(store.adopt_tss(gdt, &staged(Ring1), Ring1, TSS_CORE, &tss).is_err());
        });
    }

    #[test]
    fn test_ldt_entries_are_checked_and_trimmed() {
        let mut store = Box::new(TaskStore::new());

        // a ring-3 LDT entry reaching core memory
        let wide = Ldt::for_ring(Ring3, MEM_LIMIT);
        assert_eq!(
            store.adopt_ldt(Ring3, LDT_USERS, &wide, LDT_LIMIT),
            Err(GateError::OutOfReach(0))
        );

        let inner = Ldt::for_ring(Ring0, USERS_SYS_LIMIT);
        assert!(matches!(
            store.adopt_ldt(Ring3, LDT_USERS, &inner, LDT_LIMIT),
            Err(GateError::PrivilegeViolation { .. })
        ));

        assert_eq!(
            store.adopt_ldt(Ring3, LDT_USERS, &Ldt::for_ring(Ring3, USERS_SYS_LIMIT), 0x10),
            Err(GateError::BadArgument(0x10))
        );

        let own = Ldt::for_ring(Ring3, USERS_SYS_LIMIT);
        let base = store.adopt_ldt(Ring3, LDT_USERS, &own, 7).unwrap();
        let copy = store.ldt(LDT_USERS).unwrap();
        assert_eq!(base, copy.base());
        assert_eq!(copy.code(), own.code());
        assert!(copy.data().is_null());
    }

    #[test]
    fn test_segment_reach_per_ring() {
        let users = Ldt::for_ring(Ring3, USERS_SYS_LIMIT);
        assert_eq!(check_segment_reach(Ring3, users.data()), Ok(()));
        assert!(check_segment_reach(Ring2, users.data()).is_ok());
        let devs = Ldt::for_ring(Ring1, DEVS_LIMIT);
        assert_eq!(check_segment_reach(Ring3, devs.data()), Err(GateError::OutOfReach(0)));
        assert!(check_segment_reach(Ring0, Ldt::for_ring(Ring0, MEM_LIMIT).code()).is_ok());
    }

    #[test]
    fn test_staged_reads_only_at_the_handed_address() {
        let memory = Staged {
            tss: Some((USERS_START, users_tss())),
            ..Staged::new(Ring3)
        };
        assert!(memory.read_tss(USERS_START).is_some());
        assert!(memory.read_tss(USERS_START + 4).is_none());
        assert!(memory.owns(Ring3, USERS_START, 104));
        assert!(!memory.owns(Ring3, LIBS_START, 104));
    }
}
