// Synchronous replication core: two state trees and the transaction log.
//
// Every peer keeps two copies of the document:
// - `lockstep`: the leader's committed history, applied in index order.
// - `rollback`: lockstep plus this peer's own not-yet-confirmed proposals.
// On the leader both trees are always equal.
//
// A follower proposal claims the index it *expects* to land at
// (`next_index + speculative.len()`) and is applied to `rollback`
// immediately, keeping its undo records. When the leader's committed
// transaction for index `i` arrives:
// - identical mutations to our speculation at `i`: keep the speculative
//   result, drop the undo records;
// - different mutations: rewind the whole speculative tail, newest first,
//   then apply the committed transaction;
// - no speculation at `i`: just apply it.
// The committed stream is the only source of truth; the local log keeps only
// the unconfirmed tail and the confirmed prefix is discarded.
//
// Rewound proposals other than the one at `i` may still be in flight to the
// leader and can legitimately commit later, so they become *orphans*: still
// pending, resolved when their id commits or when the index they claimed is
// taken by someone else. Reporting them as failed up front would make a
// retrying caller apply them twice.
//
// Commits that arrive ahead of a gap are held in `early` until the gap
// fills. Commits at or below the watermark are ignored (a late joiner's
// snapshot already contains them).
//
// This module does no I/O; `store.rs` drives it and turns the returned
// outcomes into messages, observer notifications and resolved futures.

use std::collections::{BTreeMap, HashMap, VecDeque};

use lockstep_protocol::{ClientId, Event, Mutation, MutationId, MutationIndex, Transaction};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::tree::{StateTree, Undo};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// A proposal applied to `rollback` but not yet confirmed.
struct Speculative {
    transaction: Transaction,
    claimed: MutationIndex,
    undos: Vec<Undo>,
}

/// What a batch of committed transactions did to this replica.
#[derive(Debug, Default)]
pub struct Reconciled {
    /// Ids of every transaction applied, in commit order.
    pub committed: Vec<MutationId>,
    /// Own proposals that will never commit.
    pub superseded: Vec<MutationId>,
    /// Events of the applied transactions, in commit order.
    pub events: Vec<Event>,
    /// Number of committed transactions applied.
    pub applied: usize,
}

/// Leader-side verdict on a proposal.
#[derive(Debug, PartialEq)]
pub enum ProposalOutcome {
    /// Applied and assigned the next index; broadcast it.
    Committed(Transaction),
    /// Claimed an index other than the current log length.
    OutOfOrder {
        claimed: MutationIndex,
        expected: MutationIndex,
    },
    /// Does not apply to the current state; notify the proposer.
    Rejected {
        mutation_id: MutationId,
        reason: String,
    },
    /// One of our own proposals from before promotion, already reported
    /// as superseded.
    Stale,
    /// This replica is not the leader.
    NotLeader,
}

pub struct Replica {
    client_id: ClientId,
    role: Role,
    rollback: StateTree,
    lockstep: StateTree,
    /// Index the next committed transaction will carry.
    next_index: MutationIndex,
    speculative: VecDeque<Speculative>,
    orphans: HashMap<MutationId, MutationIndex>,
    early: BTreeMap<MutationIndex, Transaction>,
    next_counter: u64,
}

impl Replica {
    pub fn new(
        client_id: ClientId,
        role: Role,
        state: Value,
        last_mutation_index: Option<MutationIndex>,
    ) -> Self {
        Self {
            client_id,
            role,
            rollback: StateTree::new(state.clone()),
            lockstep: StateTree::new(state),
            next_index: last_mutation_index.map_or(MutationIndex(0), MutationIndex::next),
            speculative: VecDeque::new(),
            orphans: HashMap::new(),
            early: BTreeMap::new(),
            next_counter: 0,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn rollback(&self) -> &StateTree {
        &self.rollback
    }

    pub fn lockstep(&self) -> &StateTree {
        &self.lockstep
    }

    /// Index of the newest committed transaction applied, if any.
    pub fn last_mutation_index(&self) -> Option<MutationIndex> {
        self.next_index.0.checked_sub(1).map(MutationIndex)
    }

    /// Number of own proposals applied locally but not yet confirmed.
    pub fn unconfirmed(&self) -> usize {
        self.speculative.len()
    }

    /// Full committed state for a joining peer.
    pub fn snapshot(&self) -> (Value, Option<MutationIndex>) {
        (self.lockstep.root().clone(), self.last_mutation_index())
    }

    fn next_mutation_id(&mut self) -> MutationId {
        let id = MutationId::new(&self.client_id, self.next_counter);
        self.next_counter += 1;
        id
    }

    /// Leader: apply and commit a local transaction.
    pub fn commit_local(&mut self, mutations: Vec<Mutation>, events: Vec<Event>) -> Result<Transaction> {
        let mutation_id = self.next_mutation_id();
        self.commit(mutations, events, mutation_id)
    }

    fn commit(
        &mut self,
        mutations: Vec<Mutation>,
        events: Vec<Event>,
        mutation_id: MutationId,
    ) -> Result<Transaction> {
        let undos = self.rollback.apply_all(&mutations)?;
        if let Err(e) = self.lockstep.apply_all(&mutations) {
            self.rollback.undo_all(undos)?;
            return Err(e);
        }
        let transaction = Transaction {
            index: Some(self.next_index),
            mutations,
            events,
            mutation_id,
        };
        self.next_index = self.next_index.next();
        Ok(transaction)
    }

    /// Follower: apply a proposal optimistically and return it, with its
    /// claimed index, for sending to the leader.
    pub fn speculate(&mut self, mutations: Vec<Mutation>, events: Vec<Event>) -> Result<Transaction> {
        let claimed = MutationIndex(self.next_index.0 + self.speculative.len() as u64);
        let undos = self.rollback.apply_all(&mutations)?;
        let transaction = Transaction {
            index: Some(claimed),
            mutations,
            events,
            mutation_id: self.next_mutation_id(),
        };
        self.speculative.push_back(Speculative {
            transaction: transaction.clone(),
            claimed,
            undos,
        });
        Ok(transaction)
    }

    /// Follower: build a proposal without a claimed index. It is not applied
    /// locally; the leader commits it at whatever index is next, or rejects
    /// it if it does not apply.
    pub fn propose_unordered(&mut self, mutations: Vec<Mutation>, events: Vec<Event>) -> Transaction {
        Transaction {
            index: None,
            mutations,
            events,
            mutation_id: self.next_mutation_id(),
        }
    }

    /// Fold one committed transaction from the leader into both trees.
    pub fn receive_committed(&mut self, transaction: Transaction) -> Result<Reconciled> {
        let mut out = Reconciled::default();
        let Some(index) = transaction.index else {
            tracing::warn!(id = %transaction.mutation_id, "committed transaction without index");
            return Ok(out);
        };
        if index < self.next_index {
            tracing::debug!(%index, "ignoring commit at or below watermark");
            return Ok(out);
        }
        if index > self.next_index {
            tracing::debug!(%index, expected = %self.next_index, "holding commit until gap fills");
            self.early.insert(index, transaction);
            return Ok(out);
        }

        self.apply_canonical(transaction, &mut out)?;
        while let Some(next) = self.early.remove(&self.next_index) {
            self.apply_canonical(next, &mut out)?;
        }
        Ok(out)
    }

    fn apply_canonical(&mut self, transaction: Transaction, out: &mut Reconciled) -> Result<()> {
        let index = self.next_index;
        self.lockstep
            .apply_all(&transaction.mutations)
            .map_err(|e| diverged(index, e))?;

        let front_matches = self
            .speculative
            .front()
            .is_some_and(|s| s.transaction.mutations == transaction.mutations);
        if front_matches {
            if let Some(front) = self.speculative.pop_front() {
                // Same effect, different author: our state is already right
                // but our proposal itself will not commit.
                if front.transaction.mutation_id != transaction.mutation_id {
                    out.superseded.push(front.transaction.mutation_id);
                }
            }
        } else {
            if !self.speculative.is_empty() {
                tracing::debug!(
                    %index,
                    rewound = self.speculative.len(),
                    "speculation diverged from leader"
                );
                self.rewind_from(0, true, &mut out.superseded)?;
            }
            self.rollback
                .apply_all(&transaction.mutations)
                .map_err(|e| diverged(index, e))?;
        }

        self.orphans.remove(&transaction.mutation_id);
        let lost: Vec<MutationId> = self
            .orphans
            .iter()
            .filter(|(_, claimed)| **claimed <= index)
            .map(|(id, _)| id.clone())
            .collect();
        for id in lost {
            self.orphans.remove(&id);
            out.superseded.push(id);
        }

        out.committed.push(transaction.mutation_id);
        out.events.extend(transaction.events);
        out.applied += 1;
        self.next_index = index.next();
        Ok(())
    }

    /// Undo speculative entries `pos..`, newest first. The entry at `pos`
    /// is superseded; later ones become orphans if `orphan_rest`, else they
    /// are superseded too.
    fn rewind_from(
        &mut self,
        pos: usize,
        orphan_rest: bool,
        superseded: &mut Vec<MutationId>,
    ) -> Result<()> {
        let tail = self.speculative.split_off(pos);
        for (offset, entry) in tail.into_iter().enumerate().rev() {
            self.rollback.undo_all(entry.undos)?;
            let id = entry.transaction.mutation_id;
            if offset > 0 && orphan_rest {
                self.orphans.insert(id, entry.claimed);
            } else {
                superseded.push(id);
            }
        }
        Ok(())
    }

    /// The leader refused one of our proposals. Undo it (and anything
    /// speculated after it) and report what is now definitely lost.
    pub fn discard(&mut self, mutation_id: &MutationId) -> Result<Vec<MutationId>> {
        let mut superseded = Vec::new();
        match self
            .speculative
            .iter()
            .position(|s| s.transaction.mutation_id == *mutation_id)
        {
            Some(pos) => self.rewind_from(pos, true, &mut superseded)?,
            None => {
                self.orphans.remove(mutation_id);
                superseded.push(mutation_id.clone());
            }
        }
        Ok(superseded)
    }

    /// Leader: decide on a proposal routed to us by the relay.
    pub fn receive_proposal(&mut self, transaction: Transaction) -> Result<ProposalOutcome> {
        if self.role != Role::Leader {
            return Ok(ProposalOutcome::NotLeader);
        }
        if matches!(transaction.mutation_id.origin(), Ok(origin) if origin == self.client_id) {
            return Ok(ProposalOutcome::Stale);
        }
        match transaction.index {
            Some(claimed) if claimed != self.next_index => {
                return Ok(ProposalOutcome::OutOfOrder {
                    claimed,
                    expected: self.next_index,
                });
            }
            _ => {}
        }

        let mutation_id = transaction.mutation_id.clone();
        match self.commit(transaction.mutations, transaction.events, transaction.mutation_id) {
            Ok(committed) => Ok(ProposalOutcome::Committed(committed)),
            Err(e @ StoreError::InvalidPath { .. }) => Ok(ProposalOutcome::Rejected {
                mutation_id,
                reason: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Become the leader. Unconfirmed speculation is rewound and every
    /// pending proposal is reported superseded; commits held past a gap are
    /// discarded since their author is gone.
    pub fn promote(&mut self) -> Result<Vec<MutationId>> {
        let mut superseded = Vec::new();
        self.rewind_from(0, false, &mut superseded)?;
        superseded.extend(self.orphans.drain().map(|(id, _)| id));
        if !self.early.is_empty() {
            tracing::warn!(
                dropped = self.early.len(),
                "discarding commits received past a gap"
            );
            self.early.clear();
        }
        self.role = Role::Leader;
        debug_assert_eq!(self.rollback, self.lockstep);
        Ok(superseded)
    }
}

fn diverged(index: MutationIndex, e: StoreError) -> StoreError {
    StoreError::Diverged {
        index,
        reason: e.to_string(),
    }
}
