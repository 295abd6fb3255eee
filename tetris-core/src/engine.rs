//! Authoritative per-player game state and its deterministic transitions.
//!
//! The engine is pure: every mutation happens through `apply` or `gravity`,
//! and two engines fed the same seed and the same action sequence stay
//! cell-for-cell identical. Timing lives in the match server.

use tetris_types::{InputAction, PieceKind};

use crate::bag::BagGenerator;
use crate::piece::ActivePiece;

pub const BOARD_WIDTH: usize = 10;
pub const BOARD_HEIGHT: usize = 20;

/// Score gained per simultaneous line clear, multiplied by the level.
const LINE_SCORES: [u32; 5] = [0, 100, 300, 500, 800];

pub type Board = [[u8; BOARD_WIDTH]; BOARD_HEIGHT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The action changed the active piece in place.
    Moved,
    /// The action did not apply; state is unchanged.
    Rejected,
    /// The active piece locked, `cleared` rows were removed, and a new piece
    /// spawned (or `game_over` was set).
    Locked { cleared: u32 },
}

#[derive(Debug, Clone)]
pub struct Engine {
    board: Board,
    bag: BagGenerator,
    active: ActivePiece,
    hold: Option<PieceKind>,
    hold_used: bool,
    score: u32,
    lines: u32,
    level: u32,
    game_over: bool,
}

impl Engine {
    pub fn new(seed: u64) -> Self {
        Self::with_board(seed, [[0; BOARD_WIDTH]; BOARD_HEIGHT])
    }

    /// Start from a pre-populated board. Test hook; the first piece spawns
    /// immediately, so a blocked spawn row tops the engine out at birth.
    pub fn with_board(seed: u64, board: Board) -> Self {
        let mut bag = BagGenerator::new(seed);
        let active = ActivePiece::spawn(bag.next());
        let mut engine = Self {
            board,
            bag,
            active,
            hold: None,
            hold_used: false,
            score: 0,
            lines: 0,
            level: 1,
            game_over: false,
        };
        if !engine.fits(engine.active) {
            engine.game_over = true;
        }
        engine
    }

    pub fn apply(&mut self, action: InputAction) -> StepOutcome {
        if self.game_over {
            return StepOutcome::Rejected;
        }
        match action {
            InputAction::Left => self.shift(-1),
            InputAction::Right => self.shift(1),
            InputAction::Down => self.soft_drop(),
            InputAction::Cw => self.rotate(1),
            InputAction::Ccw => self.rotate(3),
            InputAction::HardDrop => self.hard_drop(),
            InputAction::Hold => self.hold_piece(),
        }
    }

    /// One gravity step: soft-drop semantics on a timer.
    pub fn gravity(&mut self) -> StepOutcome {
        if self.game_over {
            return StepOutcome::Rejected;
        }
        self.soft_drop()
    }

    /// Treat this player as topped out (forfeit).
    pub fn top_out(&mut self) {
        self.game_over = true;
    }

    fn shift(&mut self, dx: i32) -> StepOutcome {
        let mut moved = self.active;
        moved.x += dx;
        if self.fits(moved) {
            self.active = moved;
            StepOutcome::Moved
        } else {
            StepOutcome::Rejected
        }
    }

    fn rotate(&mut self, steps: u8) -> StepOutcome {
        let mut rotated = self.active;
        rotated.rot = (rotated.rot + steps) % 4;
        if self.fits(rotated) {
            self.active = rotated;
            StepOutcome::Moved
        } else {
            StepOutcome::Rejected
        }
    }

    fn soft_drop(&mut self) -> StepOutcome {
        let mut dropped = self.active;
        dropped.y += 1;
        if self.fits(dropped) {
            self.active = dropped;
            StepOutcome::Moved
        } else {
            let cleared = self.lock();
            StepOutcome::Locked { cleared }
        }
    }

    fn hard_drop(&mut self) -> StepOutcome {
        loop {
            let mut dropped = self.active;
            dropped.y += 1;
            if self.fits(dropped) {
                self.active = dropped;
            } else {
                break;
            }
        }
        let cleared = self.lock();
        StepOutcome::Locked { cleared }
    }

    fn hold_piece(&mut self) -> StepOutcome {
        if self.hold_used {
            return StepOutcome::Rejected;
        }
        match self.hold.take() {
            None => {
                self.hold = Some(self.active.kind);
                self.spawn_next();
            }
            Some(held) => {
                self.hold = Some(self.active.kind);
                self.active = ActivePiece::spawn(held);
            }
        }
        self.hold_used = true;
        StepOutcome::Moved
    }

    fn fits(&self, piece: ActivePiece) -> bool {
        for (x, y) in piece.cells() {
            if x < 0 || x >= BOARD_WIDTH as i32 {
                return false;
            }
            if y >= BOARD_HEIGHT as i32 {
                return false;
            }
            // Cells above the top of the board never collide.
            if y < 0 {
                continue;
            }
            if self.board[y as usize][x as usize] != 0 {
                return false;
            }
        }
        true
    }

    fn lock(&mut self) -> u32 {
        let code = self.active.kind.code();
        for (x, y) in self.active.cells() {
            if (0..BOARD_WIDTH as i32).contains(&x) && (0..BOARD_HEIGHT as i32).contains(&y) {
                self.board[y as usize][x as usize] = code;
            }
        }

        let cleared = self.clear_lines();
        if cleared > 0 {
            self.lines += cleared;
            // Score uses the level in effect before this clear.
            self.score += LINE_SCORES[cleared.min(4) as usize] * self.level;
            self.level = self.lines / 10 + 1;
        }

        self.hold_used = false;
        self.spawn_next();
        cleared
    }

    fn clear_lines(&mut self) -> u32 {
        let retained: Vec<[u8; BOARD_WIDTH]> = self
            .board
            .iter()
            .copied()
            .filter(|row| row.iter().any(|&cell| cell == 0))
            .collect();
        let cleared = (BOARD_HEIGHT - retained.len()) as u32;
        if cleared > 0 {
            let mut board = [[0u8; BOARD_WIDTH]; BOARD_HEIGHT];
            board[cleared as usize..].copy_from_slice(&retained);
            self.board = board;
        }
        cleared
    }

    fn spawn_next(&mut self) {
        self.active = ActivePiece::spawn(self.bag.next());
        if !self.fits(self.active) {
            self.game_over = true;
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn active(&self) -> ActivePiece {
        self.active
    }

    pub fn hold(&self) -> Option<PieceKind> {
        self.hold
    }

    pub fn preview(&mut self, count: usize) -> Vec<PieceKind> {
        self.bag.preview(count)
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn lines(&self) -> u32 {
        self.lines
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn game_over(&self) -> bool {
        self.game_over
    }

    /// Run-length encoding of the 200 locked cells, row-major. The active
    /// piece is not rendered in; it travels separately in snapshots.
    pub fn board_rle(&self) -> String {
        let flat: Vec<u8> = self.board.iter().flatten().copied().collect();
        encode_rle(&flat)
    }
}

/// Encode a cell run as `VxN` groups joined by commas, e.g. `0x195,1x3,0x2`.
pub fn encode_rle(cells: &[u8]) -> String {
    let mut groups: Vec<String> = Vec::new();
    let mut iter = cells.iter();
    if let Some(&first) = iter.next() {
        let mut current = first;
        let mut count = 1usize;
        for &cell in iter {
            if cell == current {
                count += 1;
            } else {
                groups.push(format!("{current}x{count}"));
                current = cell;
                count = 1;
            }
        }
        groups.push(format!("{current}x{count}"));
    }
    groups.join(",")
}

pub fn decode_rle(encoded: &str) -> Option<Vec<u8>> {
    let mut cells = Vec::new();
    if encoded.is_empty() {
        return Some(cells);
    }
    for group in encoded.split(',') {
        let (value, count) = group.split_once('x')?;
        let value: u8 = value.parse().ok()?;
        let count: usize = count.parse().ok()?;
        if count == 0 {
            return None;
        }
        cells.extend(std::iter::repeat(value).take(count));
    }
    Some(cells)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle_round_trips_boards() {
        let engine = Engine::new(42);
        let encoded = engine.board_rle();
        let decoded = decode_rle(&encoded).unwrap();
        assert_eq!(decoded.len(), BOARD_WIDTH * BOARD_HEIGHT);
        assert!(decoded.iter().all(|&c| c == 0));
        assert_eq!(encoded, "0x200");

        let mixed = [0u8, 0, 1, 1, 1, 7, 0, 0, 0, 2];
        assert_eq!(encode_rle(&mixed), "0x2,1x3,7x1,0x3,2x1");
        assert_eq!(decode_rle("0x2,1x3,7x1,0x3,2x1").unwrap(), mixed);
    }

    #[test]
    fn rle_rejects_garbage() {
        assert!(decode_rle("0x").is_none());
        assert!(decode_rle("abc").is_none());
        assert!(decode_rle("1x0").is_none());
    }

    fn seed_with_first_piece(kind: PieceKind) -> u64 {
        (0..10_000)
            .find(|&seed| Engine::new(seed).active.kind == kind)
            .expect("some seed starts with the requested kind")
    }

    /// Board with the bottom `full_rows` rows filled except the two columns
    /// an O piece spawns over, so a hard drop completes them.
    fn board_with_gap_rows(full_rows: usize) -> Board {
        let mut board = [[0u8; BOARD_WIDTH]; BOARD_HEIGHT];
        for row in &mut board[BOARD_HEIGHT - full_rows..] {
            *row = [9; BOARD_WIDTH];
            row[4] = 0;
            row[5] = 0;
        }
        board
    }

    #[test]
    fn clear_score_scales_with_pre_clear_level() {
        let seed = seed_with_first_piece(PieceKind::O);
        let mut engine = Engine::with_board(seed, board_with_gap_rows(2));
        // Pretend 9 lines were already cleared: next clear crosses the level
        // threshold, and the score must still use the pre-clear level.
        engine.lines = 9;
        engine.level = 1;

        let outcome = engine.apply(InputAction::HardDrop);
        assert_eq!(outcome, StepOutcome::Locked { cleared: 2 });
        assert_eq!(engine.score, 300); // base[2] * level 1
        assert_eq!(engine.lines, 11);
        assert_eq!(engine.level, 2); // 1 + 11/10
    }

    #[test]
    fn clear_score_uses_base_table_at_higher_levels() {
        let seed = seed_with_first_piece(PieceKind::O);
        let mut engine = Engine::with_board(seed, board_with_gap_rows(1));
        engine.lines = 30;
        engine.level = 4;

        let outcome = engine.apply(InputAction::HardDrop);
        assert_eq!(outcome, StepOutcome::Locked { cleared: 1 });
        assert_eq!(engine.score, 400); // base[1] * level 4
        assert_eq!(engine.level, 4); // 1 + 31/10
    }
}
