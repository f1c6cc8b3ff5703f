//! utility modules used throughout the project
/// logger initialisation: terminal and optional time-stamped file
pub mod logger;
/// evaluation settings read from TOML
pub mod settings;
