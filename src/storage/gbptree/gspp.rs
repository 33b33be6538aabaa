//! Generation-safe pointer pairs.
//!
//! Every inter-page reference is stored as two slots, each carrying a
//! generation, a pointer and a checksum over both. A write only ever replaces
//! the slot that does not hold the newest stable pointer, so a crash halfway
//! through a write leaves the other slot intact.

use serde::Serialize;

use crate::primitives::pager::PageCursor;
use crate::types::checksum::slot_checksum;
use crate::types::PageId;

/// Bytes in one slot: generation u64, pointer u64, checksum u32.
pub(crate) const SLOT_SIZE: usize = 20;
/// Bytes in a full pointer pair.
pub(crate) const GSPP_SIZE: usize = 2 * SLOT_SIZE;

const RESERVED_BIT: u64 = 1 << 63;

/// Classification of one slot relative to the current generations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum SlotState {
    /// Never written, or wiped by cleanup.
    Empty,
    /// Written in a checkpointed generation.
    Stable,
    /// Written in the generation currently being built.
    Unstable,
    /// Written in a generation that never reached a checkpoint.
    Crash,
    /// Checksum mismatch, reserved bit set, or generation from the future.
    Broken,
}

/// A decoded pointer together with the generation it was written in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pointer {
    /// Target page, [`PageId::NONE`] for "no node".
    pub id: PageId,
    /// Generation of the winning slot.
    pub generation: u64,
}

/// Why a pointer pair could not be resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum GsppFailureKind {
    /// Neither slot holds a readable pointer.
    Broken,
    /// Both slots claim the same generation.
    EqualGenerations,
}

/// Diagnostic for an unreadable pointer pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct GsppFailure {
    /// What went wrong.
    pub kind: GsppFailureKind,
    /// State of slot A.
    pub state_a: SlotState,
    /// State of slot B.
    pub state_b: SlotState,
    /// Generation stored in slot A.
    pub generation_a: u64,
    /// Generation stored in slot B.
    pub generation_b: u64,
}

impl std::fmt::Display for GsppFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} pointer: slot A {:?} gen {}, slot B {:?} gen {}",
            self.kind, self.state_a, self.generation_a, self.state_b, self.generation_b
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Slot {
    pub(crate) generation: u64,
    pub(crate) pointer: u64,
    pub(crate) checksum: u32,
}

impl Slot {
    fn is_zero(&self) -> bool {
        self.generation == 0 && self.pointer == 0 && self.checksum == 0
    }

    pub(crate) fn state(&self, stable: u64, unstable: u64) -> SlotState {
        if self.is_zero() {
            return SlotState::Empty;
        }
        if self.generation & RESERVED_BIT != 0
            || self.pointer & RESERVED_BIT != 0
            || self.generation == 0
            || slot_checksum(self.generation, self.pointer) != self.checksum
        {
            return SlotState::Broken;
        }
        if self.generation <= stable {
            SlotState::Stable
        } else if self.generation == unstable {
            SlotState::Unstable
        } else if self.generation > unstable {
            SlotState::Broken
        } else {
            SlotState::Crash
        }
    }
}

pub(crate) fn read_slot(cursor: &mut PageCursor<'_>, offset: usize) -> Slot {
    Slot {
        generation: cursor.get_u64_at(offset),
        pointer: cursor.get_u64_at(offset + 8),
        checksum: cursor.get_u32_at(offset + 16),
    }
}

pub(crate) fn write_slot(cursor: &mut PageCursor<'_>, offset: usize, slot: Slot) {
    cursor.put_u64_at(offset, slot.generation);
    cursor.put_u64_at(offset + 8, slot.pointer);
    cursor.put_u32_at(offset + 16, slot.checksum);
}

fn sealed(generation: u64, pointer: u64) -> Slot {
    Slot {
        generation,
        pointer,
        checksum: slot_checksum(generation, pointer),
    }
}

fn is_candidate(state: SlotState) -> bool {
    matches!(state, SlotState::Stable | SlotState::Unstable)
}

/// Both slots with their states, for diagnostics and corruption tooling.
#[derive(Copy, Clone, Debug)]
pub(crate) struct PairView {
    pub(crate) a: Slot,
    pub(crate) b: Slot,
    pub(crate) state_a: SlotState,
    pub(crate) state_b: SlotState,
}

impl PairView {
    fn failure(&self, kind: GsppFailureKind) -> GsppFailure {
        GsppFailure {
            kind,
            state_a: self.state_a,
            state_b: self.state_b,
            generation_a: self.a.generation,
            generation_b: self.b.generation,
        }
    }

    /// Index (0 = A, 1 = B) of the slot a reader would follow.
    pub(crate) fn winner(&self) -> Result<usize, GsppFailure> {
        match (is_candidate(self.state_a), is_candidate(self.state_b)) {
            (false, false) => Err(self.failure(GsppFailureKind::Broken)),
            (true, false) => Ok(0),
            (false, true) => Ok(1),
            (true, true) => {
                if self.a.generation == self.b.generation {
                    Err(self.failure(GsppFailureKind::EqualGenerations))
                } else if self.a.generation > self.b.generation {
                    Ok(0)
                } else {
                    Ok(1)
                }
            }
        }
    }

    pub(crate) fn has_state(&self, state: SlotState) -> bool {
        self.state_a == state || self.state_b == state
    }
}

pub(crate) fn view(
    cursor: &mut PageCursor<'_>,
    offset: usize,
    stable: u64,
    unstable: u64,
) -> PairView {
    let a = read_slot(cursor, offset);
    let b = read_slot(cursor, offset + SLOT_SIZE);
    PairView {
        a,
        b,
        state_a: a.state(stable, unstable),
        state_b: b.state(stable, unstable),
    }
}

/// Resolves the pointer stored at `offset`.
pub fn read(
    cursor: &mut PageCursor<'_>,
    offset: usize,
    stable: u64,
    unstable: u64,
) -> Result<Pointer, GsppFailure> {
    let pair = view(cursor, offset, stable, unstable);
    let slot = if pair.winner()? == 0 { pair.a } else { pair.b };
    Ok(Pointer {
        id: PageId(slot.pointer),
        generation: slot.generation,
    })
}

/// Stores `pointer` in the unstable slot, or in the slot that lost the last
/// read, never touching the winner.
pub fn write(
    cursor: &mut PageCursor<'_>,
    offset: usize,
    stable: u64,
    unstable: u64,
    pointer: PageId,
) -> Result<(), GsppFailure> {
    let pair = view(cursor, offset, stable, unstable);
    let target = if pair.state_a == SlotState::Unstable {
        0
    } else if pair.state_b == SlotState::Unstable {
        1
    } else if pair.state_a == SlotState::Empty && pair.state_b == SlotState::Empty {
        0
    } else {
        1 - pair.winner()?
    };
    write_slot(
        cursor,
        offset + target * SLOT_SIZE,
        sealed(unstable, pointer.0),
    );
    Ok(())
}

/// Clears both slots and writes slot A. Only for pairs inside a node created
/// in the current unstable generation.
pub fn write_fresh(cursor: &mut PageCursor<'_>, offset: usize, unstable: u64, pointer: PageId) {
    cursor.zero(offset, GSPP_SIZE);
    write_slot(cursor, offset, sealed(unstable, pointer.0));
}

/// Wipes slots left behind by a crashed generation, plus torn slots whose
/// partner still holds a readable pointer. Returns true when anything changed.
pub(crate) fn clean_crashed(
    cursor: &mut PageCursor<'_>,
    offset: usize,
    stable: u64,
    unstable: u64,
) -> bool {
    let pair = view(cursor, offset, stable, unstable);
    let mut changed = false;
    for (idx, own, partner) in [
        (0usize, pair.state_a, pair.state_b),
        (1usize, pair.state_b, pair.state_a),
    ] {
        let wipe = own == SlotState::Crash
            || (own == SlotState::Broken && partner == SlotState::Stable);
        if wipe {
            cursor.zero(offset + idx * SLOT_SIZE, SLOT_SIZE);
            changed = true;
        }
    }
    changed
}

/// Writes a slot with an arbitrary generation into the non-winning position.
pub(crate) fn write_loser_slot(
    cursor: &mut PageCursor<'_>,
    offset: usize,
    stable: u64,
    unstable: u64,
    generation: u64,
    pointer: u64,
    valid_checksum: bool,
) -> Result<(), GsppFailure> {
    let pair = view(cursor, offset, stable, unstable);
    let loser = 1 - pair.winner()?;
    let mut slot = sealed(generation, pointer);
    if !valid_checksum {
        slot.checksum ^= 0xA5A5_5A5A;
    }
    write_slot(cursor, offset + loser * SLOT_SIZE, slot);
    Ok(())
}
