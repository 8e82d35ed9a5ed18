//! Data-model modules (D/E/F): user directory, buddy/block lists, rooms.

pub mod buddy;
pub mod room;
pub mod user;
