// core.rs splits responsibilities into submodules for easier maintenance.
pub mod chain;
pub mod fork_choice;
pub mod merkle;
pub mod state;
pub mod validation;

pub use chain::*;
pub use fork_choice::*;
pub use merkle::*;
pub use state::*;
pub use validation::*;
