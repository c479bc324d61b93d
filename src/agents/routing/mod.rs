pub mod assignment;
pub mod decisions;
pub mod filters;

pub use assignment::*;
pub use decisions::*;
pub use filters::*;
