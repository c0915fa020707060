//! Task and inner-ring stacks
//!
//! Every TSS names one stack per more privileged ring plus the task's own
//! stack. All of them are statically allocated word arrays.

use crate::config::TASK_STACK_WORDS;

/// One task stack, 16-byte aligned. Grows down from [`TaskStack::top`].
#[derive(Clone, Copy)]
#[repr(C, align(16))]
pub struct TaskStack(pub [u32; TASK_STACK_WORDS]);

impl TaskStack {
    pub const fn new() -> Self {
        Self([0; TASK_STACK_WORDS])
    }

    /// Lowest address of the stack.
    pub fn base_ptr(&self) -> *const u32 {
        self.0.as_ptr()
    }

    /// One past the last word; the initial ESP.
    pub fn top_ptr(&self) -> *const u32 {
        self.0.as_ptr_range().end
    }

    pub fn top(&self) -> u32 {
        self.top_ptr() as usize as u32
    }
}

impl Default for TaskStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Stacks of one task: `INNER` inner-ring stacks (ring 0 first) and its own.
#[repr(C)]
pub struct TaskStacks<const INNER: usize> {
    pub inner: [TaskStack; INNER],
    pub task: TaskStack,
}

impl<const INNER: usize> TaskStacks<INNER> {
    pub const fn new() -> Self {
        Self {
            inner: [TaskStack::new(); INNER],
            task: TaskStack::new(),
        }
    }

    pub fn inner_tops(&self) -> [u32; INNER] {
        core::array::from_fn(|ring| self.inner[ring].top())
    }
}

impl<const INNER: usize> Default for TaskStacks<INNER> {
    fn default() -> Self {
        Self::new()
    }
}
