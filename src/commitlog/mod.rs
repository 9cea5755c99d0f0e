mod in_memory;
mod log;

pub use in_memory::InMemoryLog;
pub use log::index_or_zero;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
