mod logging;

pub use logging::init_log;
