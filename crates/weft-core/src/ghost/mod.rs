//! Deterministic speculative-step engine.
//!
//! A ghost is a state machine whose transitions are recorded in an
//! append-only ledger. A ghost either steps (its step function produces the
//! next state directly) or speculates: the caller proposes candidate next
//! states and the engine collapses the proposal to exactly one of them with
//! a selector that is a pure function of the ledger position, the ghost id,
//! the step index, and the ordered candidate tags. Identical call sequences
//! therefore produce bitwise-identical collapse results across runs and
//! platforms.
//!
//! The engine handle owns the ledger, the scheduling queue, and the ghost
//! arena; all operations take `&mut self`, so concurrent use requires an
//! external lock owned by the caller; single-writer discipline is encoded
//! in the type.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Maximum ledger entries per engine.
pub const LEDGER_CAPACITY: usize = 4096;

/// Maximum ghosts queued for scheduling.
pub const QUEUE_CAPACITY: usize = 256;

/// Identifiers (ghost ids and candidate tags) are truncated to this many
/// bytes.
pub const MAX_ID_LEN: usize = 63;

/// Fixed starting value for the collapse selector. Part of the determinism
/// contract: changing it changes every collapse result.
const COLLAPSE_SEED: u64 = 0x5745_4654_4C45_4447;

const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

/// One FNV-1a sub-hash with the prior accumulator folded into the offset.
fn fnv1a_mix(prior: u64, bytes: &[u8]) -> u64 {
    let mut acc = FNV_OFFSET_BASIS ^ prior;
    for &b in bytes {
        acc ^= u64::from(b);
        acc = acc.wrapping_mul(FNV_PRIME);
    }
    acc
}

/// Truncate to at most [`MAX_ID_LEN`] bytes, respecting UTF-8 boundaries.
fn clip_id(id: &str) -> String {
    if id.len() <= MAX_ID_LEN {
        return id.to_string();
    }
    let mut end = MAX_ID_LEN;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    id[..end].to_string()
}

/// A speculative next-state proposal: opaque payload plus a short tag used
/// for deterministic selection and audit.
#[derive(Clone)]
pub struct Candidate<S> {
    /// Proposed next state.
    pub data: Arc<S>,
    /// Tag describing the candidate; truncated to [`MAX_ID_LEN`] bytes when
    /// recorded.
    pub tag: String,
}

impl<S> Candidate<S> {
    /// Convenience constructor.
    pub fn new(data: Arc<S>, tag: impl Into<String>) -> Self {
        Self {
            data,
            tag: tag.into(),
        }
    }
}

/// One ledger record. Tags are copied in at propose time so the audit trail
/// stays valid regardless of what the caller does with its candidate array.
pub struct LedgerEntry<S> {
    ghost_id: String,
    step_index: u64,
    /// Candidate tags when this entry records a proposal.
    proposal: Option<Vec<String>>,
    /// Index chosen by collapse; `None` until collapsed (or for non-proposal
    /// entries).
    chosen: Option<usize>,
    /// State snapshot installed at this step.
    state: Option<Arc<S>>,
}

impl<S> LedgerEntry<S> {
    /// Id of the ghost this entry belongs to.
    #[must_use]
    pub fn ghost_id(&self) -> &str {
        &self.ghost_id
    }

    /// The ghost's per-ghost step counter at append time.
    #[must_use]
    pub fn step_index(&self) -> u64 {
        self.step_index
    }

    /// Copied candidate tags, when this entry records a proposal.
    #[must_use]
    pub fn proposal_tags(&self) -> Option<&[String]> {
        self.proposal.as_deref()
    }

    /// Collapse result, once recorded.
    #[must_use]
    pub fn chosen(&self) -> Option<usize> {
        self.chosen
    }

    /// State snapshot recorded with this entry.
    #[must_use]
    pub fn state(&self) -> Option<&Arc<S>> {
        self.state.as_ref()
    }
}

/// Step function: produces the next state for a non-speculative step.
pub type StepFn<S> = Box<dyn FnMut() -> Arc<S> + Send>;

struct Ghost<S> {
    id: String,
    state: Option<Arc<S>>,
    proposal: Option<Vec<Candidate<S>>>,
    step_fn: Option<StepFn<S>>,
    finished: bool,
    step_index: u64,
}

/// Key for a ghost inside its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GhostId(usize);

/// Engine handle: ledger, scheduling queue, and ghost arena.
pub struct GhostEngine<S> {
    ledger: Vec<LedgerEntry<S>>,
    queue: VecDeque<GhostId>,
    ghosts: Vec<Ghost<S>>,
}

impl<S> GhostEngine<S> {
    /// Create an engine with an empty ledger and queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ledger: Vec::new(),
            queue: VecDeque::new(),
            ghosts: Vec::new(),
        }
    }

    /// Reset the ledger, the queue, and the ghost arena to empty. Existing
    /// [`GhostId`]s become invalid.
    pub fn reset(&mut self) {
        self.ledger.clear();
        self.queue.clear();
        self.ghosts.clear();
    }

    /// Register a ghost. The id is truncated to [`MAX_ID_LEN`] bytes;
    /// duplicates are permitted and distinguished only by the returned key.
    /// Appends the step-0 ledger entry.
    ///
    /// Errors: `InvalidArgument` for an empty id, `ResourceExhausted` when
    /// the ledger is full.
    pub fn create(&mut self, id: &str, step_fn: Option<StepFn<S>>) -> Result<GhostId> {
        if id.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if self.ledger.len() >= LEDGER_CAPACITY {
            return Err(Error::ResourceExhausted);
        }
        let id = clip_id(id);
        self.ledger.push(LedgerEntry {
            ghost_id: id.clone(),
            step_index: 0,
            proposal: None,
            chosen: None,
            state: None,
        });
        self.ghosts.push(Ghost {
            id,
            state: None,
            proposal: None,
            step_fn,
            finished: false,
            step_index: 0,
        });
        Ok(GhostId(self.ghosts.len() - 1))
    }

    /// Attach a candidate array as the ghost's pending proposal and append
    /// the proposal ledger entry (step index pre-incremented, tags copied,
    /// chosen index none).
    ///
    /// Errors: `InvalidArgument` for an unknown ghost, an empty candidate
    /// array, or a finished ghost; `Busy` when a proposal is already
    /// pending; `ResourceExhausted` when the ledger is full.
    pub fn propose(&mut self, ghost: GhostId, candidates: Vec<Candidate<S>>) -> Result<()> {
        if candidates.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if self.ledger.len() >= LEDGER_CAPACITY {
            return Err(Error::ResourceExhausted);
        }
        let g = self.ghost_mut(ghost)?;
        if g.finished {
            return Err(Error::InvalidArgument);
        }
        if g.proposal.is_some() {
            return Err(Error::Busy);
        }
        g.step_index += 1;
        let entry = LedgerEntry {
            ghost_id: g.id.clone(),
            step_index: g.step_index,
            proposal: Some(candidates.iter().map(|c| clip_id(&c.tag)).collect()),
            chosen: None,
            state: None,
        };
        g.proposal = Some(candidates);
        self.ledger.push(entry);
        Ok(())
    }

    /// Deterministically collapse the most recent pending proposal for this
    /// ghost: one candidate is selected, installed as the ghost's state, and
    /// recorded (chosen index + state snapshot) in the proposal's ledger
    /// entry. Returns the chosen index.
    ///
    /// The selector seeds from the fixed engine constant and mixes, via
    /// FNV-1a sub-hashes chained through the accumulator: the entry's ledger
    /// position (the ledger length at propose time), the ghost id bytes, the
    /// step index, and each candidate tag in order. Integers are mixed as
    /// little-endian `u64` bytes.
    ///
    /// Errors: `InvalidArgument` for an unknown ghost or when no proposal is
    /// pending.
    pub fn collapse(&mut self, ghost: GhostId) -> Result<usize> {
        let g = self
            .ghosts
            .get(ghost.0)
            .ok_or(Error::InvalidArgument)?;
        if g.proposal.is_none() {
            return Err(Error::InvalidArgument);
        }
        let position = self
            .ledger
            .iter()
            .rposition(|e| e.ghost_id == g.id && e.proposal.is_some() && e.chosen.is_none())
            .ok_or(Error::InvalidArgument)?;

        let entry_step = self.ledger[position].step_index;
        let mut seed = COLLAPSE_SEED;
        seed = fnv1a_mix(seed, &(position as u64).to_le_bytes());
        seed = fnv1a_mix(seed, g.id.as_bytes());
        seed = fnv1a_mix(seed, &entry_step.to_le_bytes());
        if let Some(tags) = &self.ledger[position].proposal {
            for tag in tags {
                seed = fnv1a_mix(seed, tag.as_bytes());
            }
        }

        let g = self.ghost_mut(ghost)?;
        let candidates = g.proposal.take().ok_or(Error::InvalidArgument)?;
        let chosen = (seed % candidates.len() as u64) as usize;
        let state = Arc::clone(&candidates[chosen].data);
        g.state = Some(Arc::clone(&state));

        let entry = &mut self.ledger[position];
        entry.chosen = Some(chosen);
        entry.state = Some(state);
        Ok(chosen)
    }

    /// Execute one non-speculative step: the step function produces the next
    /// state, which is installed and recorded in a fresh ledger entry.
    ///
    /// Errors: `InvalidArgument` for an unknown or finished ghost, or one
    /// created without a step function; `Busy` while a proposal is pending
    /// (collapse it first); `ResourceExhausted` when the ledger is full.
    pub fn step(&mut self, ghost: GhostId) -> Result<()> {
        if self.ledger.len() >= LEDGER_CAPACITY {
            return Err(Error::ResourceExhausted);
        }
        let g = self.ghost_mut(ghost)?;
        if g.finished {
            return Err(Error::InvalidArgument);
        }
        if g.proposal.is_some() {
            return Err(Error::Busy);
        }
        let step_fn = g.step_fn.as_mut().ok_or(Error::InvalidArgument)?;
        let next = step_fn();
        g.state = Some(Arc::clone(&next));
        g.step_index += 1;
        let entry = LedgerEntry {
            ghost_id: g.id.clone(),
            step_index: g.step_index,
            proposal: None,
            chosen: None,
            state: Some(next),
        };
        self.ledger.push(entry);
        Ok(())
    }

    /// Append a ghost to the scheduling queue.
    ///
    /// Errors: `InvalidArgument` for an unknown ghost, `Busy` when the queue
    /// is full.
    pub fn queue_add(&mut self, ghost: GhostId) -> Result<()> {
        self.ghost_ref(ghost)?;
        if self.queue.len() >= QUEUE_CAPACITY {
            return Err(Error::Busy);
        }
        self.queue.push_back(ghost);
        Ok(())
    }

    /// One scheduling round: for each queued, unfinished ghost, collapse its
    /// pending proposal if one exists, otherwise step it (ghosts with
    /// neither are skipped). Queue order is preserved.
    ///
    /// Errors: `InvalidArgument` when the queue is empty; the first failing
    /// collapse/step aborts the round.
    pub fn schedule(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let round: Vec<GhostId> = self.queue.iter().copied().collect();
        for gid in round {
            let (finished, pending, can_step) = match self.ghost_ref(gid) {
                Ok(g) => (g.finished, g.proposal.is_some(), g.step_fn.is_some()),
                Err(_) => continue,
            };
            if finished {
                continue;
            }
            if pending {
                self.collapse(gid)?;
            } else if can_step {
                self.step(gid)?;
            }
        }
        Ok(())
    }

    /// Current collapsed state of a ghost.
    ///
    /// Errors: `InvalidArgument` for an unknown ghost.
    pub fn state(&self, ghost: GhostId) -> Result<Option<Arc<S>>> {
        Ok(self.ghost_ref(ghost)?.state.clone())
    }

    /// Whether the ghost has finished. Unknown ghosts report finished.
    #[must_use]
    pub fn is_finished(&self, ghost: GhostId) -> bool {
        self.ghost_ref(ghost).map(|g| g.finished).unwrap_or(true)
    }

    /// Retire a ghost: drop the ledger-owned tag copies recorded under this
    /// ghost's id, clear the ghost's fields, and mark it finished. A pending
    /// proposal's payloads stay with the caller (ownership is unchanged).
    ///
    /// Errors: `InvalidArgument` for an unknown ghost.
    pub fn dispose(&mut self, ghost: GhostId) -> Result<()> {
        let id = self.ghost_ref(ghost)?.id.clone();
        for entry in self.ledger.iter_mut().filter(|e| e.ghost_id == id) {
            entry.proposal = None;
        }
        let g = self.ghost_mut(ghost)?;
        g.state = None;
        g.proposal = None;
        g.step_fn = None;
        g.finished = true;
        Ok(())
    }

    /// Number of ledger entries appended so far.
    #[must_use]
    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    /// Audit access to a ledger entry.
    #[must_use]
    pub fn ledger_entry(&self, index: usize) -> Option<&LedgerEntry<S>> {
        self.ledger.get(index)
    }

    /// Number of ghosts waiting in the scheduling queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn ghost_ref(&self, ghost: GhostId) -> Result<&Ghost<S>> {
        self.ghosts.get(ghost.0).ok_or(Error::InvalidArgument)
    }

    fn ghost_mut(&mut self, ghost: GhostId) -> Result<&mut Ghost<S>> {
        self.ghosts.get_mut(ghost.0).ok_or(Error::InvalidArgument)
    }
}

impl<S> Default for GhostEngine<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for GhostEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GhostEngine")
            .field("ledger_len", &self.ledger.len())
            .field("queued", &self.queue.len())
            .field("ghosts", &self.ghosts.len())
            .finish()
    }
}
