//! AttachmentPoint: a copy-on-write chain of attached trace programs.
//!
//! The published chain is immutable: attach and detach build a brand-new
//! sequence under a mutex and install it with a single atomic swap, while
//! dispatch readers traverse whichever snapshot they loaded without taking
//! any lock. A retired sequence is reclaimed only after every reader that
//! might still be iterating it has left its read window.
//!
//! Detach is the one operation that must never fail: when rebuilding the
//! sequence is impossible (allocation failure), the entry is marked
//! removed in place so the program stops being invoked regardless, at the
//! cost of leaving the old structure pending reclamation.

use crate::errors::Error;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A trace program attachable to an attachment point.
///
/// `run` receives an opaque mutable context and returns a raw integer
/// verdict: 0 suppresses the triggering event, 1 records it, and other
/// values are reserved (currently treated as 1). Programs run on the
/// dispatch hot path and must not block.
pub trait TraceProgram<C>: Send + Sync {
    fn run(&self, ctx: &mut C) -> i32;
}

/// Outcome of a program invocation, or of a whole chain traversal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Filter the event out; the caller should not record it.
    Suppress,
    /// Record the event.
    Record,
}

impl Verdict {
    /// Map a raw program return value onto a verdict. Zero suppresses;
    /// every other value, including reserved ones, records.
    #[inline]
    pub fn from_raw(raw: i32) -> Self {
        if raw == 0 {
            Verdict::Suppress
        } else {
            Verdict::Record
        }
    }
}

/// How the verdicts of a multi-program chain combine into one.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CombinePolicy {
    /// Every program must record for the event to be recorded.
    #[default]
    All,
    /// One recording program suffices.
    Any,
    /// The last program's verdict wins.
    Last,
}

struct ChainEntry<C> {
    program: Arc<dyn TraceProgram<C>>,
    /// In-place detach fallback. A marked entry is skipped by readers and
    /// dropped with the sequence that contains it.
    removed: AtomicBool,
}

impl<C> ChainEntry<C> {
    fn new(program: Arc<dyn TraceProgram<C>>) -> Self {
        Self {
            program,
            removed: AtomicBool::new(false),
        }
    }

    fn is_live(&self) -> bool {
        !self.removed.load(Ordering::Acquire)
    }
}

/// Immutable published sequence. Never mutated after the swap that
/// installs it, except for the `removed` marks.
struct Chain<C> {
    entries: Box<[ChainEntry<C>]>,
}

impl<C> Chain<C> {
    /// Copy the live entries, append `extra` if given, drop `without` if
    /// given. Allocation failure leaves the published chain untouched.
    fn try_rebuild(
        &self,
        extra: Option<Arc<dyn TraceProgram<C>>>,
        without: Option<&Arc<dyn TraceProgram<C>>>,
    ) -> Result<Chain<C>, Error> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(self.entries.len() + usize::from(extra.is_some()))
            .map_err(|_| Error::ResourceExhausted)?;
        for entry in self.entries.iter().filter(|e| e.is_live()) {
            if without.is_some_and(|w| same_program(&entry.program, w)) {
                continue;
            }
            entries.push(ChainEntry::new(Arc::clone(&entry.program)));
        }
        if let Some(program) = extra {
            entries.push(ChainEntry::new(program));
        }
        Ok(Chain {
            entries: entries.into_boxed_slice(),
        })
    }

    fn singleton(program: Arc<dyn TraceProgram<C>>) -> Result<Chain<C>, Error> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(1)
            .map_err(|_| Error::ResourceExhausted)?;
        entries.push(ChainEntry::new(program));
        Ok(Chain {
            entries: entries.into_boxed_slice(),
        })
    }

    fn contains(&self, program: &Arc<dyn TraceProgram<C>>) -> bool {
        self.entries
            .iter()
            .any(|e| e.is_live() && same_program(&e.program, program))
    }

    fn live_len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }
}

/// Identity comparison by data pointer; two `Arc` handles to the same
/// program compare equal regardless of how the trait object was created.
fn same_program<C>(a: &Arc<dyn TraceProgram<C>>, b: &Arc<dyn TraceProgram<C>>) -> bool {
    core::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

/// The logical event a program chain is associated with. Attach/detach are
/// serialized against each other by a mutex; dispatch reads never take it.
pub struct AttachmentPoint<C> {
    chain: Atomic<Chain<C>>,
    update: Mutex<()>,
    policy: CombinePolicy,
}

impl<C> AttachmentPoint<C> {
    pub fn new(policy: CombinePolicy) -> Self {
        Self {
            chain: Atomic::null(),
            update: Mutex::new(()),
            policy,
        }
    }

    pub fn policy(&self) -> CombinePolicy {
        self.policy
    }

    /// Cheap emptiness heuristic for the dispatch fast path: a single
    /// pointer read, no dereference. A chain whose every entry is marked
    /// removed still reads as armed; traversal then yields the neutral
    /// verdict, which is the accepted cost of keeping this check one load.
    #[inline]
    pub fn is_armed(&self) -> bool {
        // Null check only; the pointer is never dereferenced here.
        let guard = unsafe { epoch::unprotected() };
        !self.chain.load(Ordering::Acquire, guard).is_null()
    }

    /// Number of live attachments in the current snapshot.
    pub fn attached(&self, guard: &Guard) -> usize {
        let shared = self.chain.load(Ordering::Acquire, guard);
        unsafe { shared.as_ref() }.map_or(0, Chain::live_len)
    }

    /// Whether `program` appears live in the current snapshot.
    pub fn is_attached(&self, program: &Arc<dyn TraceProgram<C>>, guard: &Guard) -> bool {
        let shared = self.chain.load(Ordering::Acquire, guard);
        unsafe { shared.as_ref() }.is_some_and(|c| c.contains(program))
    }

    /// Attach `program` to this point. Fails with `AlreadyAttached` when
    /// the same program is already live here, and with
    /// `ResourceExhausted` when the rebuilt sequence cannot be allocated;
    /// in both cases the published chain is unchanged.
    pub fn attach(&self, program: Arc<dyn TraceProgram<C>>) -> Result<(), Error> {
        let _serialize = self.update.lock();
        let guard = epoch::pin();
        let current = self.chain.load(Ordering::Acquire, &guard);

        let rebuilt = match unsafe { current.as_ref() } {
            Some(chain) => {
                if chain.contains(&program) {
                    return Err(Error::AlreadyAttached);
                }
                chain.try_rebuild(Some(program), None)?
            }
            None => Chain::singleton(program)?,
        };
        let live = rebuilt.live_len();
        self.publish(rebuilt, current, &guard);
        debug!("program attached; chain now holds {live} program(s)");
        Ok(())
    }

    /// Detach `program` from this point. Always succeeds: if the program
    /// is absent this is a no-op, and if the rebuilt sequence cannot be
    /// allocated the entry is marked removed in place instead. Either way
    /// the program stops appearing in subsequently read snapshots, and its
    /// handle is released once no reader can still observe it.
    pub fn detach(&self, program: &Arc<dyn TraceProgram<C>>) {
        let _serialize = self.update.lock();
        let guard = epoch::pin();
        let current = self.chain.load(Ordering::Acquire, &guard);
        let Some(chain) = (unsafe { current.as_ref() }) else {
            return;
        };
        if !chain.contains(program) {
            return;
        }

        match chain.try_rebuild(None, Some(program)) {
            Ok(rebuilt) if rebuilt.entries.is_empty() => {
                let old = self.chain.swap(Shared::null(), Ordering::AcqRel, &guard);
                unsafe { guard.defer_destroy(old) };
                debug!("last program detached; chain disarmed");
            }
            Ok(rebuilt) => {
                let live = rebuilt.live_len();
                self.publish(rebuilt, current, &guard);
                debug!("program detached; chain now holds {live} program(s)");
            }
            Err(_) => {
                warn!("chain rebuild failed on detach; marking entry removed in place");
                mark_removed(chain, program);
            }
        }
    }

    fn publish(&self, rebuilt: Chain<C>, expected_old: Shared<'_, Chain<C>>, guard: &Guard) {
        let old = self.chain.swap(Owned::new(rebuilt), Ordering::AcqRel, guard);
        debug_assert_eq!(old, expected_old);
        if !old.is_null() {
            // Safety: unlinked by the swap above while the update lock is
            // held; no new reader can load it.
            unsafe { guard.defer_destroy(old) };
        }
    }

    /// Traverse the current snapshot, run every live program against
    /// `ctx`, and combine verdicts per this point's policy. An empty or
    /// fully marked chain is neutral and records.
    pub(crate) fn run_programs(&self, ctx: &mut C, guard: &Guard) -> Verdict {
        let shared = self.chain.load(Ordering::Acquire, guard);
        let Some(chain) = (unsafe { shared.as_ref() }) else {
            return Verdict::Record;
        };

        let mut ran = false;
        let mut all = Verdict::Record;
        let mut any = Verdict::Suppress;
        let mut last = Verdict::Record;
        for entry in chain.entries.iter() {
            if !entry.is_live() {
                continue;
            }
            let verdict = Verdict::from_raw(entry.program.run(ctx));
            ran = true;
            if verdict == Verdict::Suppress {
                all = Verdict::Suppress;
            } else {
                any = Verdict::Record;
            }
            last = verdict;
        }
        if !ran {
            return Verdict::Record;
        }
        match self.policy {
            CombinePolicy::All => all,
            CombinePolicy::Any => any,
            CombinePolicy::Last => last,
        }
    }
}

impl<C> Drop for AttachmentPoint<C> {
    fn drop(&mut self) {
        // Safety: `&mut self` guarantees no concurrent reader.
        let guard = unsafe { epoch::unprotected() };
        let shared = self.chain.load(Ordering::Relaxed, guard);
        if !shared.is_null() {
            drop(unsafe { shared.into_owned() });
        }
    }
}

fn mark_removed<C>(chain: &Chain<C>, program: &Arc<dyn TraceProgram<C>>) {
    for entry in chain.entries.iter() {
        if same_program(&entry.program, program) {
            entry.removed.store(true, Ordering::Release);
        }
    }
}
