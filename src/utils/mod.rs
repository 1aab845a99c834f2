pub mod format;
pub mod instance;
pub mod logging;
pub mod shell;
