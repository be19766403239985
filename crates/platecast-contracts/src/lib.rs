pub mod events;
pub mod media;
pub mod models;
pub mod providers;
pub mod runs;
