mod data_rw;
mod setup;
mod status;

pub use data_rw::*;
pub use setup::*;
pub use status::*;
