pub mod time;
pub mod filters;
pub mod leap;
pub mod stats;
pub mod traits;
pub mod persist;
pub mod clock;
pub mod phc;
pub mod servo;
pub mod config;
pub mod status;
