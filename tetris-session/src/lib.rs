pub mod connection;
pub mod handlers;
pub mod launcher;
pub mod registry;

pub use handlers::SessionShared;
pub use launcher::{LauncherConfig, MatchLauncher};
pub use registry::Registry;
