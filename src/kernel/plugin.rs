// Handler contract between transaction plugins and the scheduler.
//
// A plugin value is its own immutable config. All mutable data lives in
// State (one transaction's continuation plus locals) and Persistent
// (outlives transactions), both owned by the scheduler slot.

use core::fmt;

use crate::codec::{CodecError, CommandReader, ReplyWriter};
use crate::drivers::peripherals::{Bus, BusError, Peripherals};
use crate::kernel::continuation::{Corrupt, Status};
use crate::kernel::wait::{WaitError, WaitSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    /// Persisted resume point names no step of the handler. Fatal.
    CorruptResumePoint(u8),
    Bus(BusError),
    Codec(CodecError),
    Wait(WaitError),
    /// Stuck at one resume point longer than the wait policy allows
    DeadlineExceeded { point: u8 },
    Aborted,
}

impl HandlerError {
    /// Faults that mean the instance state can't be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::CorruptResumePoint(_))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::CorruptResumePoint(raw) => write!(f, "corrupt resume point {}", raw),
            HandlerError::Bus(e) => write!(f, "bus: {}", e),
            HandlerError::Codec(e) => write!(f, "codec: {}", e),
            HandlerError::Wait(e) => write!(f, "wait: {}", e),
            HandlerError::DeadlineExceeded { point } => {
                write!(f, "deadline exceeded at resume point {}", point)
            }
            HandlerError::Aborted => write!(f, "aborted"),
        }
    }
}

impl From<Corrupt> for HandlerError {
    fn from(c: Corrupt) -> Self {
        HandlerError::CorruptResumePoint(c.0)
    }
}

impl From<BusError> for HandlerError {
    fn from(e: BusError) -> Self {
        HandlerError::Bus(e)
    }
}

impl From<CodecError> for HandlerError {
    fn from(e: CodecError) -> Self {
        HandlerError::Codec(e)
    }
}

impl From<WaitError> for HandlerError {
    fn from(e: WaitError) -> Self {
        HandlerError::Wait(e)
    }
}

/// Per-transaction state the scheduler can inspect without knowing the
/// handler's step enum.
pub trait TransactionState: Default {
    /// Raw persisted resume point.
    fn resume_point(&self) -> u8;

    /// Back to the initial point, locals cleared.
    fn reset(&mut self);
}

pub trait Plugin {
    type State: TransactionState;
    type Persistent: Default;

    /// The bus this plugin drives; leased for the whole transaction.
    fn bus(&self) -> Bus;

    /// Prepare `state` for a new transaction.
    fn init(&self, state: &mut Self::State) -> Result<(), HandlerError> {
        state.reset();
        Ok(())
    }

    /// One-time setup of the long-lived state, at registration.
    fn handler_init(&self, _persistent: &mut Self::Persistent) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Run the transaction as far as it can go without blocking.
    ///
    /// Re-invoking while a registered condition is still pending must be
    /// a no-op beyond re-checking it.
    fn resume<H: Peripherals>(
        &self,
        state: &mut Self::State,
        persistent: &mut Self::Persistent,
        input: &mut CommandReader<'_>,
        output: &mut ReplyWriter<'_>,
        waits: &mut WaitSet,
        hw: &mut H,
    ) -> Result<Status, HandlerError>;

    /// Abandon the transaction: cancel whatever the current step has in
    /// flight and reset `state`.
    fn abort<H: Peripherals>(&self, state: &mut Self::State, hw: &mut H) {
        if state.resume_point() != 0 {
            hw.cancel(self.bus());
        }
        state.reset();
    }
}
