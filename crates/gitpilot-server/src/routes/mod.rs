pub mod context;
pub mod events;
pub mod operations;
pub mod sessions;
pub mod status;
pub mod ws;
