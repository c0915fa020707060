//! Ring bootstrap sequencer
//!
//! Ring 0 brings the outer rings up one at a time:
//!
//! ```text
//! Core -> Devs -> Core -> Libs -> Core -> Users -> Core -> SysReady
//! ```
//!
//! Each hop outward is an `iretd` with a fabricated frame and a
//! [`ResumeToken`] in EAX. The ring installs its own descriptors through the
//! call gates and then hands the token back through `CG_CORE_RESUME`. Ring 0
//! only follows tokens it issued itself, each one exactly once. After the users
//! ring returns, the sequencer hands off to the users main task and is done.

pub mod devs;
pub mod libs;
pub mod ring0;
pub mod stack;
pub mod tasks;
pub mod users;

use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use crate::kernel::error::{BootError, BootResult};
use crate::layout::{
    code_selector_for, data_selector_for, DEVS_STACK, LIBS_STACK, TSS_MAIN_TASK, USERS_STACK,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    Core,
    Devs,
    Libs,
    Users,
    SysReady,
}

impl BootStage {
    /// Outer ring this stage runs in, if any.
    pub const fn ring(self) -> Option<PrivilegeLevel> {
        match self {
            Self::Devs => Some(PrivilegeLevel::Ring1),
            Self::Libs => Some(PrivilegeLevel::Ring2),
            Self::Users => Some(PrivilegeLevel::Ring3),
            Self::Core | Self::SysReady => None,
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::Devs => 0,
            Self::Libs => 1,
            _ => 2,
        }
    }

    const fn stack(self) -> u32 {
        match self {
            Self::Devs => DEVS_STACK,
            Self::Libs => LIBS_STACK,
            _ => USERS_STACK,
        }
    }

    const fn after(self) -> Self {
        match self {
            Self::Core => Self::Devs,
            Self::Devs => Self::Libs,
            Self::Libs => Self::Users,
            Self::Users | Self::SysReady => Self::SysReady,
        }
    }
}

/// Frame popped by `iretd` on a privilege change, lowest address first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct IretFrame {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl IretFrame {
    /// Entry frame for ring `dpl`: interrupts off, IOPL 0.
    pub const fn ring_entry(entry: u32, dpl: PrivilegeLevel, stack: u32) -> Self {
        Self {
            eip: entry,
            cs: code_selector_for(dpl).0 as u32,
            eflags: 0,
            esp: stack,
            ss: data_selector_for(dpl).0 as u32,
        }
    }
}

/// One-shot continuation handed to an outer ring.
///
/// Outer rings can only carry it around and give it back; ring 0 accepts
/// it once, and only while it is the pending one.
#[derive(Debug, PartialEq, Eq)]
pub struct ResumeToken(u32);

impl ResumeToken {
    pub(crate) const fn new(continuation: u32) -> Self {
        Self(continuation)
    }

    pub fn into_raw(self) -> u32 {
        self.0
    }

    /// # Safety
    /// `raw` must come from [`ResumeToken::into_raw`] of a token handed to
    /// this ring; the sequencer still rejects anything it did not issue.
    pub unsafe fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Addresses fixed at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPlan {
    /// Ring entry stubs for devs, libs and users.
    pub entries: [u32; 3],
    /// Ring-0 continuations run after each of them resumes.
    pub continuations: [u32; 3],
}

#[derive(Debug, PartialEq, Eq)]
pub enum Transition {
    EnterRing {
        stage: BootStage,
        frame: IretFrame,
        token: ResumeToken,
    },
    EnterMainTask(SegmentSelector),
}

pub struct RingSequencer {
    plan: BootPlan,
    stage: BootStage,
    entered: u8,
    pending: Option<u32>,
}

impl RingSequencer {
    pub const fn new(plan: BootPlan) -> Self {
        Self {
            plan,
            stage: BootStage::Core,
            entered: 0,
            pending: None,
        }
    }

    pub fn stage(&self) -> BootStage {
        self.stage
    }

    /// Leaves `Core` for the devs ring.
    pub fn start(&mut self) -> BootResult<Transition> {
        if self.stage != BootStage::Core || self.entered != 0 {
            return Err(BootError::AlreadyStarted);
        }
        self.enter(BootStage::Devs)
    }

    /// Redeems a token presented at `CG_CORE_RESUME` and returns the
    /// continuation address to jump to.
    pub fn accept(&mut self, token: ResumeToken) -> BootResult<u32> {
        match self.pending {
            Some(pending) if pending == token.0 => {
                self.pending = None;
                Ok(pending)
            }
            _ => Err(BootError::InvalidToken(token.0)),
        }
    }

    /// Called by the continuation of `from` once its ring has resumed.
    pub fn resume(&mut self, from: BootStage) -> BootResult<Transition> {
        if self.stage == BootStage::SysReady {
            return Err(BootError::AlreadyReady);
        }
        if from != self.stage || self.pending.is_some() {
            return Err(BootError::UnexpectedResume {
                expected: self.stage,
                found: from,
            });
        }

        match from.after() {
            BootStage::SysReady => {
                self.stage = BootStage::SysReady;
                log::info!("ring bootstrap complete");
                Ok(Transition::EnterMainTask(TSS_MAIN_TASK))
            }
            next => self.enter(next),
        }
    }

    fn enter(&mut self, stage: BootStage) -> BootResult<Transition> {
        let (Some(dpl), slot) = (stage.ring(), stage.slot()) else {
            return Err(BootError::AlreadyReady);
        };
        let bit = 1 << slot;
        if self.entered & bit != 0 {
            return Err(BootError::RingReentered(stage));
        }
        self.entered |= bit;
        self.stage = stage;

        let continuation = self.plan.continuations[slot];
        self.pending = Some(continuation);
        log::debug!("entering {:?} at {:#x}", stage, self.plan.entries[slot]);
        Ok(Transition::EnterRing {
            stage,
            frame: IretFrame::ring_entry(self.plan.entries[slot], dpl, stage.stack()),
            token: ResumeToken::new(continuation),
        })
    }
}

#[cfg(target_arch = "x86")]
pub(crate) mod hardware {
    //! Drives the sequencer on the CPU.

    use spin::{Mutex, Once};

    use super::*;
    use crate::arch::x86::{self, stubs};

    static SEQUENCER: Once<Mutex<RingSequencer>> = Once::new();

    fn plan() -> BootPlan {
        BootPlan {
            entries: [
                stubs::address(stubs::devs_entry),
                stubs::address(stubs::libs_entry),
                stubs::address(stubs::users_entry),
            ],
            continuations: [
                after_devs as usize as u32,
                after_libs as usize as u32,
                after_users as usize as u32,
            ],
        }
    }

    fn fatal(error: BootError) -> ! {
        log::error!("ring bootstrap: {}", error);
        crate::kernel::fatal(format_args!("BOOT: {}", error))
    }

    fn follow(transition: BootResult<Transition>) -> ! {
        match transition {
            Ok(Transition::EnterRing { frame, token, .. }) => {
                // SAFETY: the frame names a flat segment pair of the target
                // ring and an entry stub linked into this image.
                unsafe { x86::enter_ring(&frame, token.into_raw()) }
            }
            Ok(Transition::EnterMainTask(tss)) => {
                // SAFETY: the users ring installed and patched this TSS.
                unsafe { x86::jump_to_task(tss) }
            }
            Err(e) => fatal(e),
        }
    }

    /// Hands control to the devs ring. Never returns.
    pub fn start() -> ! {
        let sequencer = SEQUENCER.call_once(|| Mutex::new(RingSequencer::new(plan())));
        let transition = sequencer.lock().start();
        follow(transition)
    }

    /// Target of the `CG_CORE_RESUME` stub, on the ring-0 stack.
    pub extern "C" fn core_resume(raw: u32) -> ! {
        let accepted = match SEQUENCER.get() {
            // SAFETY: rejected below unless it is the pending token.
            Some(sequencer) => sequencer.lock().accept(unsafe { ResumeToken::from_raw(raw) }),
            None => Err(BootError::InvalidToken(raw)),
        };
        match accepted {
            Ok(continuation) => {
                // SAFETY: continuations come from `plan()` and are
                // `extern "C" fn() -> !`.
                let continuation: extern "C" fn() -> ! =
                    unsafe { core::mem::transmute(continuation as usize) };
                continuation()
            }
            Err(e) => fatal(e),
        }
    }

    fn continue_from(stage: BootStage) -> ! {
        let transition = match SEQUENCER.get() {
            Some(sequencer) => sequencer.lock().resume(stage),
            None => Err(BootError::UnexpectedResume {
                expected: BootStage::Core,
                found: stage,
            }),
        };
        follow(transition)
    }

    extern "C" fn after_devs() -> ! {
        crate::kernel::ring::ring0::after_ring(BootStage::Devs);
        continue_from(BootStage::Devs)
    }

    extern "C" fn after_libs() -> ! {
        crate::kernel::ring::ring0::after_ring(BootStage::Libs);
        continue_from(BootStage::Libs)
    }

    extern "C" fn after_users() -> ! {
        crate::kernel::ring::ring0::after_ring(BootStage::Users);
        continue_from(BootStage::Users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::*;

    const PLAN: BootPlan = BootPlan {
        entries: [0x10_1000, 0x10_2000, 0x10_3000],
        continuations: [0x10_A000, 0x10_B000, 0x10_C000],
    };

    /// Follows a transition the way the ring would: hand the token back.
    fn ring_returns(seq: &mut RingSequencer, transition: Transition) -> BootStage {
        match transition {
            Transition::EnterRing { stage, token, .. } => {
                seq.accept(token).unwrap();
                stage
            }
            Transition::EnterMainTask(_) => panic!("not a ring entry"),
        }
    }

    #[test]
    fn test_full_sequence_reaches_sys_ready_once() {
        let mut seq = RingSequencer::new(PLAN);
        let mut visited = Vec::new();

        let mut transition = seq.start().unwrap();
        loop {
            match transition {
                Transition::EnterMainTask(tss) => {
                    assert_eq!(tss, TSS_MAIN_TASK);
                    break;
                }
                t => {
                    let stage = ring_returns(&mut seq, t);
                    visited.push(stage);
                    transition = seq.resume(stage).unwrap();
                }
            }
        }

        assert_eq!(visited, [BootStage::Devs, BootStage::Libs, BootStage::Users]);
        assert_eq!(seq.stage(), BootStage::SysReady);
        assert_eq!(seq.resume(BootStage::Users), Err(BootError::AlreadyReady));
        assert_eq!(seq.start(), Err(BootError::AlreadyStarted));
    }

    #[test]
    fn test_entry_frames() {
        let mut seq = RingSequencer::new(PLAN);
        let Transition::EnterRing { stage, frame, token } = seq.start().unwrap() else {
            panic!("expected ring entry");
        };
        assert_eq!(stage, BootStage::Devs);
        assert_eq!(
            frame,
            IretFrame {
                eip: 0x10_1000,
                cs: DEVS_CODE.0 as u32,
                eflags: 0,
                esp: DEVS_STACK,
                ss: DEVS_DATA.0 as u32,
            }
        );
        assert_eq!(token.into_raw(), 0x10_A000);
    }

    #[test]
    fn test_tokens_are_one_shot() {
        let mut seq = RingSequencer::new(PLAN);
        let Transition::EnterRing { token, .. } = seq.start().unwrap() else {
            panic!("expected ring entry");
        };
        let raw = token.into_raw();

        let forged = unsafe { ResumeToken::from_raw(0xDEAD_BEEF) };
        assert_eq!(seq.accept(forged), Err(BootError::InvalidToken(0xDEAD_BEEF)));

        assert_eq!(seq.accept(unsafe { ResumeToken::from_raw(raw) }), Ok(0x10_A000));
        assert_eq!(
            seq.accept(unsafe { ResumeToken::from_raw(raw) }),
            Err(BootError::InvalidToken(raw))
        );
    }

    #[test]
    fn test_out_of_order_resume_is_rejected() {
        let mut seq = RingSequencer::new(PLAN);
        let first = seq.start().unwrap();

        // continuation reached without redeeming the token
        assert!(matches!(
            seq.resume(BootStage::Devs),
            Err(BootError::UnexpectedResume { .. })
        ));

        ring_returns(&mut seq, first);
        assert_eq!(
            seq.resume(BootStage::Libs),
            Err(BootError::UnexpectedResume {
                expected: BootStage::Devs,
                found: BootStage::Libs,
            })
        );
        assert!(seq.resume(BootStage::Devs).is_ok());
        assert_eq!(seq.stage(), BootStage::Libs);
    }

    #[test]
    fn test_ring_is_never_entered_twice() {
        let mut seq = RingSequencer::new(PLAN);
        seq.start().unwrap();
        seq.pending = None;
        seq.stage = BootStage::Core;
        assert_eq!(seq.enter(BootStage::Devs), Err(BootError::RingReentered(BootStage::Devs)));
    }
}
