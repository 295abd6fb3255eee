pub mod server;

pub use server::{run_match, MatchConfig, MatchOutcome};
