pub mod entries;
pub mod errors;
pub mod events;
pub mod summary;
