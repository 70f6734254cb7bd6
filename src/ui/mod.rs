pub mod icons;
pub mod progress;
pub mod table;

pub use progress::{RunUI, format_duration};
