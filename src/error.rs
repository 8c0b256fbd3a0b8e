//! Bit-exact status codes returned by the scheduling core. These are
//! matched on by callers to decide retry vs. terminal handling, so they are
//! a closed, stable enum rather than a type-erased error.

/// Stable status codes. Discriminants must not change across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum Code {
    #[default]
    Success = 0,
    InstanceAllocated = 1,
    ResourceNotEnough = 2,
    AffinityScheduleFailed = 3,
    InvalidResourceParameter = 4,
    NoPreemptableInstance = 5,
    ScheduleCanceled = 6,
    Failed = 7,
}

impl Code {
    pub fn is_success(self) -> bool {
        matches!(self, Code::Success | Code::InstanceAllocated)
    }

    /// True for the two feasibility failures the pending-queue loop retries
    /// on resource update, and that the preemption controller may act on.
    pub fn is_feasibility_failure(self) -> bool {
        matches!(self, Code::ResourceNotEnough | Code::AffinityScheduleFailed)
    }
}

/// A status with a human-readable reason, returned alongside `Code` from
/// plugins and performers.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub code: Code,
    pub reason: String,
}

impl Status {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_success()
    }
}
