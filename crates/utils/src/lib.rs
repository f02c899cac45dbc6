pub mod logging;
pub mod shared_memory;
