pub mod duration;
pub mod error;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod stage;
pub mod template;
