pub mod settlement;
pub mod state;
pub mod transfer;
pub mod trigger;
pub mod user;

pub use settlement::*;
pub use state::*;
pub use transfer::*;
pub use trigger::*;
pub use user::*;
