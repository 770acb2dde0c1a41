// Cooperative transaction scheduler and its building blocks
// Single core, no preemption. Handlers return at every suspension; the
// scheduler decides when to call them again. WFI idles the CPU between
// events.
//
// continuation: persisted resume points
// wait:         what a suspended instance is waiting for
// plugin:       the handler contract
// registry:     configured plugins and their long-lived state
// lease:        one transaction per bus at a time
// scheduler:    instance slots, ready queue, tick loop
// wake:         ISR -> main loop notification flags

pub mod continuation;
pub mod lease;
pub mod plugin;
pub mod registry;
pub mod scheduler;
pub mod wait;
pub mod wake;

pub use continuation::{Continuation, Corrupt, ResumePoint, Status};
pub use plugin::{HandlerError, Plugin, TransactionState};
pub use registry::{PluginId, Registry};
pub use scheduler::{
    InstanceId, Outcome, Phase, Reply, Scheduler, SchedulerConfig, SubmitError, TickReport,
    WaitPolicy,
};
pub use wait::{Wait, WaitError, WaitSet};
