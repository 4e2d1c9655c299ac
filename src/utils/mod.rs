pub mod deps;
pub mod disk_space;
pub mod logger;

pub use deps::DependencyStatus;
pub use logger::init_logging;
