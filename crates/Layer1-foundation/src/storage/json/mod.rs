mod store;

pub use store::FileStore;
