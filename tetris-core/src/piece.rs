//! Tetromino geometry: per-kind rotation states as cell offsets from the
//! piece origin (the top-left of its bounding box), and spawn placement.

use tetris_types::PieceKind;

pub type Offsets = [(i32, i32); 4];

/// Rotation states for every kind, indexed by `rot % 4`. Symmetric kinds
/// repeat states so every kind exposes four indices; no wall kicks — a
/// rotation that does not fit in place is rejected.
const I_STATES: [Offsets; 4] = [
    [(0, 1), (1, 1), (2, 1), (3, 1)],
    [(2, 0), (2, 1), (2, 2), (2, 3)],
    [(0, 1), (1, 1), (2, 1), (3, 1)],
    [(2, 0), (2, 1), (2, 2), (2, 3)],
];

const O_STATES: [Offsets; 4] = [
    [(0, 0), (1, 0), (0, 1), (1, 1)],
    [(0, 0), (1, 0), (0, 1), (1, 1)],
    [(0, 0), (1, 0), (0, 1), (1, 1)],
    [(0, 0), (1, 0), (0, 1), (1, 1)],
];

const T_STATES: [Offsets; 4] = [
    [(1, 0), (0, 1), (1, 1), (2, 1)],
    [(1, 0), (1, 1), (2, 1), (1, 2)],
    [(0, 1), (1, 1), (2, 1), (1, 2)],
    [(1, 0), (0, 1), (1, 1), (1, 2)],
];

const S_STATES: [Offsets; 4] = [
    [(1, 0), (2, 0), (0, 1), (1, 1)],
    [(1, 0), (1, 1), (2, 1), (2, 2)],
    [(1, 0), (2, 0), (0, 1), (1, 1)],
    [(1, 0), (1, 1), (2, 1), (2, 2)],
];

const Z_STATES: [Offsets; 4] = [
    [(0, 0), (1, 0), (1, 1), (2, 1)],
    [(2, 0), (1, 1), (2, 1), (1, 2)],
    [(0, 0), (1, 0), (1, 1), (2, 1)],
    [(2, 0), (1, 1), (2, 1), (1, 2)],
];

const J_STATES: [Offsets; 4] = [
    [(0, 0), (0, 1), (1, 1), (2, 1)],
    [(1, 0), (2, 0), (1, 1), (1, 2)],
    [(0, 1), (1, 1), (2, 1), (2, 2)],
    [(1, 0), (1, 1), (0, 2), (1, 2)],
];

const L_STATES: [Offsets; 4] = [
    [(2, 0), (0, 1), (1, 1), (2, 1)],
    [(1, 0), (1, 1), (1, 2), (2, 2)],
    [(0, 1), (1, 1), (2, 1), (0, 2)],
    [(0, 0), (1, 0), (1, 1), (1, 2)],
];

pub fn offsets(kind: PieceKind, rot: u8) -> &'static Offsets {
    let states = match kind {
        PieceKind::I => &I_STATES,
        PieceKind::O => &O_STATES,
        PieceKind::T => &T_STATES,
        PieceKind::S => &S_STATES,
        PieceKind::Z => &Z_STATES,
        PieceKind::J => &J_STATES,
        PieceKind::L => &L_STATES,
    };
    &states[(rot % 4) as usize]
}

/// Spawn x, horizontally centering the kind's bounding box on a 10-wide
/// board: width/2 - box/2.
fn spawn_x(kind: PieceKind) -> i32 {
    match kind {
        PieceKind::I => 3,
        _ => 4,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivePiece {
    pub kind: PieceKind,
    pub x: i32,
    pub y: i32,
    pub rot: u8,
}

impl ActivePiece {
    pub fn spawn(kind: PieceKind) -> Self {
        Self {
            kind,
            x: spawn_x(kind),
            y: 0,
            rot: 0,
        }
    }

    /// The four board cells this placement occupies.
    pub fn cells(&self) -> [(i32, i32); 4] {
        let mut cells = *offsets(self.kind, self.rot);
        for cell in &mut cells {
            cell.0 += self.x;
            cell.1 += self.y;
        }
        cells
    }
}
