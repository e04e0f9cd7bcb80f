pub mod chat;
pub mod events;
pub mod stylist;
pub mod summary;
pub mod wardrobe;
