//! Dispatcher: glue between a firing trace point and its program chain.
//!
//! `fire` is the hot path: one reentrancy check, one armed check, one
//! snapshot load, then the programs. It never blocks and never allocates;
//! the only allocation reachable from a firing is the stack table's
//! insert-on-miss branch, when a program chooses to capture a stack.
//! Internal faults (reentry, unknown point) surface as a suppressed
//! verdict, never as an error — firing a trace point must not fault the
//! caller.

use crate::errors::Error;
use crate::program_chain::{AttachmentPoint, CombinePolicy, TraceProgram, Verdict};
use crate::reentrancy::DispatchGuard;
use crossbeam_epoch as epoch;
use std::sync::Arc;

/// Owns a fixed set of attachment points, addressed by index.
pub struct Dispatcher<C> {
    points: Box<[AttachmentPoint<C>]>,
}

impl<C> Dispatcher<C> {
    /// A dispatcher with `points` attachment points sharing one verdict
    /// combination policy.
    pub fn new(points: usize, policy: CombinePolicy) -> Self {
        Self::from_points((0..points).map(|_| AttachmentPoint::new(policy)).collect())
    }

    /// A dispatcher over pre-built points, e.g. with per-point policies.
    pub fn from_points(points: Vec<AttachmentPoint<C>>) -> Self {
        Self {
            points: points.into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> Option<&AttachmentPoint<C>> {
        self.points.get(index)
    }

    /// Attach `program` at point `index`. Unlike firing, attachment is a
    /// control-path operation and does report failures.
    pub fn attach(&self, index: usize, program: Arc<dyn TraceProgram<C>>) -> Result<(), Error> {
        self.points.get(index).ok_or(Error::OutOfRange)?.attach(program)
    }

    /// Detach `program` from point `index`. Never fails; an unknown index
    /// or absent program is a no-op.
    pub fn detach(&self, index: usize, program: &Arc<dyn TraceProgram<C>>) {
        if let Some(point) = self.points.get(index) {
            point.detach(program);
        }
    }

    /// Run the programs attached at `index` against `ctx` and return the
    /// combined verdict.
    ///
    /// Reentrant invocation on the same thread is suppressed without
    /// touching the chain; an unknown point suppresses; an unarmed point
    /// records (the neutral verdict for "nothing to consult").
    pub fn fire(&self, index: usize, ctx: &mut C) -> Verdict {
        let Some(_permit) = DispatchGuard::try_enter() else {
            return Verdict::Suppress;
        };
        let Some(point) = self.points.get(index) else {
            return Verdict::Suppress;
        };
        if !point.is_armed() {
            return Verdict::Record;
        }
        let guard = epoch::pin();
        point.run_programs(ctx, &guard)
    }
}
