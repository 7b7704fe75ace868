// =============================================================================
// Matrixon Matrix NextServer - Sliding Sync Operations Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Computes the SYNC / INSERT / DELETE / INVALIDATE script that moves a
//   client's view of one list from its last acknowledged state to the
//   current order. Every script is replayed against a model of the client
//   before it leaves this module.
//
// Performance Targets:
//   • Moves inside a window are bounded; larger reorders fall back to a resync
//   • O(window) replay verification per list per turn
//
// =============================================================================

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ordering::SortKey,
    ranges::{Range, RangeSet},
};
use crate::{utils::error::check_invariant, Result};

/// One incremental list operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Op {
    Sync {
        range: Range,
        room_ids: Vec<OwnedRoomId>,
    },
    Insert {
        index: usize,
        room_id: OwnedRoomId,
    },
    Delete {
        index: usize,
    },
    Invalidate {
        range: Range,
    },
}

/// What the client holds for one list after a committed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListState {
    /// Full order at capture time; its length is the list count.
    pub order: Vec<OwnedRoomId>,
    /// Requested ranges clamped to `order.len()`. Only these rows are known
    /// to the client.
    pub ranges: RangeSet,
    pub sort: Vec<SortKey>,
}

impl ListState {
    pub fn count(&self) -> usize {
        self.order.len()
    }

    /// Rooms inside the live ranges.
    pub fn visible_rooms(&self) -> impl Iterator<Item = &OwnedRoomId> + '_ {
        self.ranges.indices().filter_map(|i| self.order.get(i))
    }

    fn rows(&self, range: &Range) -> &[OwnedRoomId] {
        &self.order[range.start()..=range.end()]
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub ops: Vec<Op>,
    pub next: ListState,
    /// The script is an INVALIDATE + SYNC resync rather than a diff.
    pub fell_back: bool,
}

/// Op generator for a single list.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    /// DELETE/INSERT pairs allowed per list per turn.
    pub max_moves: usize,
    /// Return an error on a failed replay instead of resyncing.
    pub strict: bool,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            max_moves: 5,
            strict: false,
        }
    }
}

impl Reconciler {
    pub fn new(max_moves: usize, strict: bool) -> Self {
        Self { max_moves, strict }
    }

    /// Compute the ops taking the client from `prev` to `new_order` over the
    /// `requested` ranges. `force_resync` is set when the sort keys changed.
    pub fn reconcile(
        &self,
        prev: Option<&ListState>,
        new_order: Vec<OwnedRoomId>,
        requested: &RangeSet,
        sort: Vec<SortKey>,
        force_resync: bool,
    ) -> Result<Reconciliation> {
        let ranges = requested.clamp(new_order.len());
        let next = ListState {
            order: new_order,
            ranges,
            sort,
        };

        let Some(prev) = prev else {
            let ops = sync_ranges(&next);
            self.verify(None, &ops, &next)?;
            return Ok(Reconciliation {
                ops,
                next,
                fell_back: false,
            });
        };

        let candidate = if force_resync {
            debug!("🔧 Sort keys changed, resyncing list");
            None
        } else {
            let diff = self.diff(prev, &next);
            if diff.is_none() {
                debug!(
                    "🔧 No incremental script within {} moves, resyncing list",
                    self.max_moves
                );
            }
            diff
        };
        self.settle(prev, candidate, next)
    }

    /// Send `candidate` if it replays to exactly `next`, otherwise resync
    /// the list. A failed replay is an invariant violation.
    fn settle(
        &self,
        prev: &ListState,
        candidate: Option<Vec<Op>>,
        next: ListState,
    ) -> Result<Reconciliation> {
        if let Some(ops) = candidate {
            match ClientView::replay(Some(prev), &ops, &next) {
                Ok(()) => {
                    return Ok(Reconciliation {
                        ops,
                        next,
                        fell_back: false,
                    })
                }
                Err(violation) => check_invariant(
                    self.strict,
                    false,
                    &format!("list diff failed replay: {violation}"),
                )?,
            }
        }

        let ops = resync(prev, &next);
        self.verify(Some(prev), &ops, &next)?;
        Ok(Reconciliation {
            ops,
            next,
            fell_back: true,
        })
    }

    fn verify(&self, prev: Option<&ListState>, ops: &[Op], next: &ListState) -> Result<()> {
        match ClientView::replay(prev, ops, next) {
            Ok(()) => Ok(()),
            Err(violation) => check_invariant(
                self.strict,
                false,
                &format!("list resync failed replay: {violation}"),
            ),
        }
    }

    /// Incremental script, or `None` when the move budget is exhausted.
    fn diff(&self, prev: &ListState, next: &ListState) -> Option<Vec<Op>> {
        let mut ops: Vec<Op> = prev
            .ranges
            .subtract(&next.ranges)
            .into_iter()
            .map(|range| Op::Invalidate { range })
            .collect();

        let mut syncs = Vec::new();
        let mut budget = self.max_moves;
        for range in next.ranges.iter() {
            for span in prev.ranges.intersect_range(range) {
                diff_span(
                    prev.rows(&span),
                    next.rows(&span),
                    span.start(),
                    &mut budget,
                    &mut ops,
                )?;
            }
            for gap in prev.ranges.uncovered_in(range) {
                syncs.push(Op::Sync {
                    range: gap,
                    room_ids: next.rows(&gap).to_vec(),
                });
            }
        }

        ops.extend(syncs);
        Some(ops)
    }
}

/// One SYNC per live range.
fn sync_ranges(next: &ListState) -> Vec<Op> {
    next.ranges
        .iter()
        .map(|range| Op::Sync {
            range: *range,
            room_ids: next.rows(range).to_vec(),
        })
        .collect()
}

/// Drop everything the client holds and send the live ranges again.
fn resync(prev: &ListState, next: &ListState) -> Vec<Op> {
    let mut ops: Vec<Op> = prev
        .ranges
        .iter()
        .map(|range| Op::Invalidate { range: *range })
        .collect();
    ops.extend(sync_ranges(next));
    ops
}

/// Emit DELETE/INSERT pairs turning `old` into `new` (equal lengths) inside a
/// span starting at `offset`. Fails once `budget` pairs have been used.
fn diff_span(
    old: &[OwnedRoomId],
    new: &[OwnedRoomId],
    offset: usize,
    budget: &mut usize,
    ops: &mut Vec<Op>,
) -> Option<()> {
    let mut current = old.to_vec();
    loop {
        let Some(p) = (0..new.len()).find(|&i| current[i] != new[i]) else {
            return Some(());
        };
        let q = (0..new.len()).rev().find(|&i| current[i] != new[i])?;

        if *budget == 0 {
            return None;
        }
        *budget -= 1;

        let (delete, insert) = if current[p..q] == new[p + 1..=q] {
            // new[p] moved up or came in through the top edge
            (q, p)
        } else if current[p + 1..=q] == new[p..q] {
            // row p moved down or out through the bottom edge
            (p, q)
        } else {
            let target = &new[p];
            let from = match (p..current.len()).find(|&i| current[i] == *target) {
                Some(i) => i,
                None => (p..current.len()).find(|&i| !new.contains(&current[i]))?,
            };
            (from, p)
        };

        current.remove(delete);
        current.insert(insert, new[insert].clone());
        ops.push(Op::Delete {
            index: offset + delete,
        });
        ops.push(Op::Insert {
            index: offset + insert,
            room_id: new[insert].clone(),
        });
    }
}

/// The client's view of one list: known rows by index.
#[derive(Debug)]
pub struct ClientView {
    rows: BTreeMap<usize, OwnedRoomId>,
    old_count: usize,
    new_count: usize,
}

impl ClientView {
    /// Apply `ops` to the view implied by `prev` and check the result is
    /// exactly `next` over its live ranges.
    pub fn replay(
        prev: Option<&ListState>,
        ops: &[Op],
        next: &ListState,
    ) -> std::result::Result<(), String> {
        let mut view = ClientView {
            rows: prev
                .map(|p| {
                    p.ranges
                        .indices()
                        .map(|i| (i, p.order[i].clone()))
                        .collect()
                })
                .unwrap_or_default(),
            old_count: prev.map_or(0, ListState::count),
            new_count: next.count(),
        };

        let mut pending_delete = None;
        for op in ops {
            match (op, pending_delete.take()) {
                (Op::Insert { index, room_id }, Some(from)) => {
                    view.apply_move(from, *index, room_id)?
                }
                (Op::Delete { index }, None) => {
                    if *index >= view.old_count.min(view.new_count) {
                        return Err(format!("DELETE {index} out of bounds"));
                    }
                    if !view.rows.contains_key(index) {
                        return Err(format!("DELETE {index} of an unknown row"));
                    }
                    pending_delete = Some(*index);
                }
                (Op::Invalidate { range }, None) => view.invalidate(range)?,
                (Op::Sync { range, room_ids }, None) => view.sync(range, room_ids)?,
                (Op::Insert { index, .. }, None) => {
                    return Err(format!("INSERT {index} without a preceding DELETE"))
                }
                (other, Some(from)) => {
                    return Err(format!("DELETE {from} followed by {other:?}"))
                }
            }
        }
        if let Some(index) = pending_delete {
            return Err(format!("dangling DELETE {index}"));
        }

        let expected: BTreeMap<usize, OwnedRoomId> = next
            .ranges
            .indices()
            .map(|i| (i, next.order[i].clone()))
            .collect();
        if view.rows != expected {
            return Err(format!(
                "client view {:?} does not match {:?}",
                view.rows, expected
            ));
        }
        Ok(())
    }

    fn invalidate(&mut self, range: &Range) -> std::result::Result<(), String> {
        if range.end() >= self.old_count {
            return Err(format!("INVALIDATE {range:?} beyond old count {}", self.old_count));
        }
        for i in range.start()..=range.end() {
            if self.rows.remove(&i).is_none() {
                return Err(format!("INVALIDATE of unknown row {i}"));
            }
        }
        Ok(())
    }

    fn sync(&mut self, range: &Range, room_ids: &[OwnedRoomId]) -> std::result::Result<(), String> {
        if range.end() >= self.new_count {
            return Err(format!("SYNC {range:?} beyond count {}", self.new_count));
        }
        if room_ids.len() != range.len() {
            return Err(format!(
                "SYNC {range:?} carries {} rooms",
                room_ids.len()
            ));
        }
        for (i, room_id) in (range.start()..=range.end()).zip(room_ids) {
            self.rows.insert(i, room_id.clone());
        }
        Ok(())
    }

    fn apply_move(
        &mut self,
        from: usize,
        to: usize,
        room_id: &OwnedRoomId,
    ) -> std::result::Result<(), String> {
        if to >= self.new_count {
            return Err(format!("INSERT {to} beyond count {}", self.new_count));
        }
        let between = if from <= to { from..=to } else { to..=from };
        if let Some(i) = between.clone().find(|i| !self.rows.contains_key(i)) {
            return Err(format!("move {from} -> {to} crosses unknown row {i}"));
        }

        if from < to {
            for i in from..to {
                let shifted = self.rows[&(i + 1)].clone();
                self.rows.insert(i, shifted);
            }
        } else {
            for i in (to..from).rev() {
                let shifted = self.rows[&i].clone();
                self.rows.insert(i + 1, shifted);
            }
        }
        self.rows.insert(to, room_id.clone());
        Ok(())
    }
}
