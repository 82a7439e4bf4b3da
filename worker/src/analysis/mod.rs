pub mod spots;
pub mod threshold;

pub use spots::{detect, PixelGrid, Spot};
pub use threshold::{estimate, ThresholdStatistic};
