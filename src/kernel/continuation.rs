// Persisted "where was I" for a resumable handler.
//
// A handler has no stack across suspensions. Its position is a small
// resume point stored as a raw byte (the persisted form) and decoded on
// every call into the handler's own enum; anything that doesn't decode
// is corrupted state, not a runtime condition.

use core::fmt;
use core::marker::PhantomData;

/// What a handler tells the scheduler after one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Transaction complete; the continuation is back at its initial point.
    Done,
    /// Re-invoke once a condition registered in the wait set clears.
    Waiting,
    /// Moved on without registering a wait; re-invoke on the next tick.
    Yield,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Done => write!(f, "done"),
            Status::Waiting => write!(f, "waiting"),
            Status::Yield => write!(f, "yield"),
        }
    }
}

/// The finite set of labels a handler may resume at.
pub trait ResumePoint: Copy + Eq + fmt::Debug {
    const INITIAL: Self;

    fn from_raw(raw: u8) -> Option<Self>;

    fn into_raw(self) -> u8;
}

/// Declare a resume-point enum with explicit discriminants.
/// The first variant is the initial point and must be `= 0`.
#[macro_export]
macro_rules! resume_points {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $first:ident = 0,
            $($variant:ident = $value:expr),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        $vis enum $name {
            $first = 0,
            $($variant = $value),*
        }

        impl $crate::kernel::continuation::ResumePoint for $name {
            const INITIAL: Self = $name::$first;

            fn from_raw(raw: u8) -> Option<Self> {
                match raw {
                    0 => Some($name::$first),
                    $(r if r == $value => Some($name::$variant),)*
                    _ => None,
                }
            }

            fn into_raw(self) -> u8 {
                self as u8
            }
        }
    };
}

/// Decode failure: the persisted byte names no label of the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corrupt(pub u8);

pub struct Continuation<P> {
    raw: u8,
    _point: PhantomData<P>,
}

impl<P: ResumePoint> Continuation<P> {
    pub fn new() -> Self {
        Self {
            raw: P::INITIAL.into_raw(),
            _point: PhantomData,
        }
    }

    /// Where the next call resumes.
    pub fn point(&self) -> Result<P, Corrupt> {
        P::from_raw(self.raw).ok_or(Corrupt(self.raw))
    }

    pub fn raw(&self) -> u8 {
        self.raw
    }

    /// Overwrite the persisted byte as-is. Restores state from storage;
    /// an invalid value is reported by the next `point()`.
    pub fn set_raw(&mut self, raw: u8) {
        self.raw = raw;
    }

    pub fn is_initial(&self) -> bool {
        self.raw == P::INITIAL.into_raw()
    }

    /// Suspend until a registered condition clears, resuming at `next`.
    #[inline]
    pub fn suspend(&mut self, next: P) -> Status {
        self.raw = next.into_raw();
        Status::Waiting
    }

    /// Give the scheduler back control, resuming at `next` right away.
    #[inline]
    pub fn advance(&mut self, next: P) -> Status {
        self.raw = next.into_raw();
        Status::Yield
    }

    /// Last step done; ready for the next transaction.
    #[inline]
    pub fn finish(&mut self) -> Status {
        self.reset();
        Status::Done
    }

    pub fn reset(&mut self) {
        self.raw = P::INITIAL.into_raw();
    }
}

impl<P: ResumePoint> Default for Continuation<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for Continuation<P> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw,
            _point: PhantomData,
        }
    }
}

impl<P: ResumePoint> fmt::Debug for Continuation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.point() {
            Ok(p) => write!(f, "Continuation({:?})", p),
            Err(Corrupt(raw)) => write!(f, "Continuation(<corrupt {}>)", raw),
        }
    }
}
