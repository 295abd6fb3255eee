pub mod bag;
pub mod engine;
pub mod piece;

pub use bag::BagGenerator;
pub use engine::{Board, Engine, StepOutcome, BOARD_HEIGHT, BOARD_WIDTH};
pub use piece::ActivePiece;
