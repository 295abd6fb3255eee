pub mod errors;
pub mod framing;
pub mod messages;
pub mod model;

pub use errors::*;
pub use messages::*;
pub use model::*;
