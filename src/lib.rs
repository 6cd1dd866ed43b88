//! tracetable: a deduplicating call-stack table and a lock-free trace
//! program dispatch path.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: let trace points fire concurrently on many threads while the
//!   shared state they consult — captured stacks and the attached program
//!   chain — is published, looked up, and retired without readers taking
//!   locks.
//! - Layers:
//!   - StackTable: fixed-capacity, hash-indexed store of deduplicated
//!     call stacks. The hash reduced modulo capacity is the slot index,
//!     and that index is the lookup key; lookups are wait-free, updates
//!     publish through a single atomic swap.
//!   - AttachmentPoint: an immutable, copy-on-write chain of attached
//!     trace programs. Attach/detach rebuild the sequence under a mutex
//!     and swap it in atomically; dispatch readers always traverse a
//!     stable snapshot.
//!   - DispatchGuard: a per-thread 0/1 counter that refuses reentrant
//!     dispatch instead of recursing.
//!   - Dispatcher: the glue that checks the guard, reads the snapshot,
//!     runs the programs, and combines their verdicts.
//!
//! Constraints
//! - Lookup and dispatch reads are wait-free: a bounded number of memory
//!   reads, no locks, no retries.
//! - StackTable insert/remove are lock-free: the race window is closed by
//!   one atomic take-or-swap on the owning slot, not a lock.
//! - Attach/detach are lock-based but contend only against each other,
//!   never against dispatch.
//! - Nothing on the dispatch hot path blocks or allocates; the only
//!   allocation reachable from a firing is StackTable's insert-on-miss.
//!
//! Reclamation
//! - Replaced or removed records and retired chain snapshots are freed
//!   through epoch-based reclamation (crossbeam-epoch): a reader that
//!   observed a reference keeps it valid for the duration of its pinned
//!   guard, and writers never wait for readers — only the actual freeing
//!   is deferred. `pin` and `Guard` are re-exported so callers can scope
//!   their protected read windows.
//!
//! Collision policy
//! - The table resolves collisions by caller policy (reject or
//!   overwrite) rather than chaining; that is what keeps lookup a single
//!   indexed read. The fast-compare flag goes one step further and
//!   accepts hash equality as identity — see `CaptureFlags::fast_compare`
//!   for the documented false-positive trade-off.
//!
//! Notes and non-goals
//! - No iteration over the table: slots have no meaningful total order.
//! - Dispatch never reports errors to the firing caller; every internal
//!   fault maps to the suppressed verdict.
//! - Teardown relies on exclusive access (`&mut`/ownership) as its read
//!   barrier; callers must stop issuing lookups before dropping.

mod dispatch;
mod errors;
mod program_chain;
mod reentrancy;
mod stack_table;

// Public surface
pub use crossbeam_epoch::{pin, Guard};
pub use dispatch::Dispatcher;
pub use errors::Error;
pub use program_chain::{AttachmentPoint, CombinePolicy, TraceProgram, Verdict};
pub use reentrancy::{DispatchGuard, DispatchPermit};
pub use stack_table::{CaptureFlags, StackTable, TableConfig, MAX_STACK_DEPTH};
