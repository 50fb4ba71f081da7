pub mod chat;
pub mod events;
pub mod image;
pub mod layers;
pub mod models;
pub mod session;
pub mod store;
