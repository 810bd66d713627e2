pub mod persistence_impl;

pub use persistence_impl::PersistenceBackend;
