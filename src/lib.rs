pub mod conf;
pub mod kafka;
pub mod utils;
