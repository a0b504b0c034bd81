pub mod delivery;
pub mod event;
pub mod location;
