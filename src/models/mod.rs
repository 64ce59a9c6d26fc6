pub mod diagnostics;
pub mod error;
pub mod events;
pub mod health;
pub mod ready;

pub use diagnostics::*;
pub use error::*;
pub use events::*;
pub use health::*;
pub use ready::*;
