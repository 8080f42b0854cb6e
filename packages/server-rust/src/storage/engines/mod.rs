pub mod memory;

pub use memory::MemoryDocumentStore;
