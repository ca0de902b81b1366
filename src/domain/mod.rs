pub mod battery;
pub mod grid;
pub mod wallbox;

pub use battery::*;
pub use grid::*;
pub use wallbox::*;
