#![forbid(unsafe_code)]
//! Journal sequence tracking as seen by the accounting core.
//!
//! The accounting core never writes the journal. It needs three things from
//! it: the sequence number new updates are charged to, the highest sequence
//! already durable on disk, and a way to force entries out. Usage
//! accumulators rotate with the journal's in-flight buffers, so the journal
//! also tells interested parties when the entry for a sequence has been
//! written and its buffer slot can be folded.
//!
//! [`MemJournal`] is an in-memory implementation: sequences advance on
//! demand and a flush marks everything up to the target durable.
//!
//! # Logging
//!
//! Target `ffs::journal`: DEBUG on every entry open and every flush.

use ffs_error::{FfsError, Result};
use ffs_types::JournalSeq;
use parking_lot::Mutex;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Journal interface consumed by the accounting core.
pub trait JournalSeqSource: Send + Sync {
    /// Sequence of the currently open entry.
    fn cur_seq(&self) -> JournalSeq;

    /// Highest sequence known durable.
    fn last_seq_ondisk(&self) -> JournalSeq;

    /// Make every entry up to and including `seq` durable.
    fn flush_seq(&self, seq: JournalSeq) -> Result<()>;
}

/// Notified once per sequence after its entry has been written.
pub trait JournalBufHook: Send + Sync {
    fn buf_written(&self, seq: JournalSeq);
}

#[derive(Debug, Default)]
struct FlushState {
    /// Injected failure for the next flush.
    fail_next: Option<String>,
}

/// In-memory journal with a monotonically advancing sequence.
pub struct MemJournal {
    seq: AtomicU64,
    durable: AtomicU64,
    state: Mutex<FlushState>,
    hooks: Mutex<Vec<Weak<dyn JournalBufHook>>>,
}

impl std::fmt::Debug for MemJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemJournal")
            .field("seq", &self.seq.load(Ordering::Relaxed))
            .field("durable", &self.durable.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MemJournal {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemJournal {
    /// Journal whose first open entry is `start`; nothing is durable yet.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self {
            seq: AtomicU64::new(start),
            durable: AtomicU64::new(start.saturating_sub(1)),
            state: Mutex::new(FlushState::default()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register a write-completion hook. Dropped hooks are pruned lazily.
    pub fn subscribe(&self, hook: Weak<dyn JournalBufHook>) {
        self.hooks.lock().push(hook);
    }

    /// Close the open entry and open the next one, returning its sequence.
    pub fn advance(&self) -> JournalSeq {
        let next = self.seq.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        debug!(target: "ffs::journal", event = "journal_entry_open", seq = next);
        JournalSeq(next)
    }

    /// Make the next flush fail with an I/O error.
    pub fn fail_next_flush(&self, reason: impl Into<String>) {
        self.state.lock().fail_next = Some(reason.into());
    }

    fn notify(&self, seq: JournalSeq) {
        let mut hooks = self.hooks.lock();
        hooks.retain(|hook| match hook.upgrade() {
            Some(hook) => {
                hook.buf_written(seq);
                true
            }
            None => false,
        });
    }
}

impl JournalSeqSource for MemJournal {
    fn cur_seq(&self) -> JournalSeq {
        JournalSeq(self.seq.load(Ordering::Acquire))
    }

    fn last_seq_ondisk(&self) -> JournalSeq {
        JournalSeq(self.durable.load(Ordering::Acquire))
    }

    fn flush_seq(&self, seq: JournalSeq) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_next.take() {
            debug!(
                target: "ffs::journal",
                event = "journal_flush_failed",
                seq = seq.0,
                reason = %reason
            );
            return Err(FfsError::Io(std::io::Error::other(reason)));
        }

        let target = seq.0.min(self.cur_seq().0);
        let from = self.durable.load(Ordering::Acquire);
        for written in from.saturating_add(1)..=target {
            self.durable.store(written, Ordering::Release);
            self.notify(JournalSeq(written));
        }
        drop(state);

        debug!(
            target: "ffs::journal",
            event = "journal_flush",
            requested = seq.0,
            durable = self.durable.load(Ordering::Acquire)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
    }

    impl JournalBufHook for Recorder {
        fn buf_written(&self, seq: JournalSeq) {
            self.seen.lock().push(seq.0);
        }
    }

    #[test]
    fn advance_and_flush_track_durability() {
        let j = MemJournal::new(1);
        assert_eq!(j.cur_seq(), JournalSeq(1));
        assert_eq!(j.last_seq_ondisk(), JournalSeq(0));
        assert_eq!(j.advance(), JournalSeq(2));
        assert_eq!(j.advance(), JournalSeq(3));
        j.flush_seq(JournalSeq(2)).expect("flush");
        assert_eq!(j.last_seq_ondisk(), JournalSeq(2));
    }

    #[test]
    fn flush_beyond_open_entry_is_capped() {
        let j = MemJournal::new(5);
        j.flush_seq(JournalSeq(100)).expect("flush");
        assert_eq!(j.last_seq_ondisk(), JournalSeq(5));
    }

    #[test]
    fn hooks_see_each_written_sequence_once() {
        let j = MemJournal::new(1);
        let rec = Arc::new(Recorder::default());
        let weak: Weak<dyn JournalBufHook> = Arc::downgrade(&rec) as Weak<dyn JournalBufHook>;
        j.subscribe(weak);
        j.advance();
        j.advance();
        j.flush_seq(JournalSeq(2)).expect("flush");
        j.flush_seq(JournalSeq(3)).expect("flush");
        j.flush_seq(JournalSeq(3)).expect("flush");
        assert_eq!(*rec.seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn dropped_hooks_are_pruned() {
        let j = MemJournal::new(1);
        {
            let rec = Arc::new(Recorder::default());
            j.subscribe(Arc::downgrade(&rec) as Weak<dyn JournalBufHook>);
        }
        j.flush_seq(JournalSeq(1)).expect("flush");
        assert!(j.hooks.lock().is_empty());
    }

    #[test]
    fn injected_failure_surfaces_as_io() {
        let j = MemJournal::new(1);
        j.fail_next_flush("disk unplugged");
        let err = j.flush_seq(JournalSeq(1)).expect_err("injected");
        assert!(matches!(err, FfsError::Io(_)));
        assert_eq!(j.last_seq_ondisk(), JournalSeq(0));
        j.flush_seq(JournalSeq(1)).expect("second flush succeeds");
        assert_eq!(j.last_seq_ondisk(), JournalSeq(1));
    }
}
