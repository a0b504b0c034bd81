pub mod eta;
pub mod proximity;
pub mod tracker;

pub use tracker::Tracker;
