pub mod diagnostics;
pub mod health;
pub mod ws;

pub use diagnostics::*;
pub use health::*;
pub use ws::*;
