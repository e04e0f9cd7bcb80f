mod record;
mod store;

pub use record::{GarmentRecord, GARMENT_FIELDS};
pub use store::WardrobeStore;
