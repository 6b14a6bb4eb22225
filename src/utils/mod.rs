pub mod atomic_write;
pub mod data_dir;
pub mod formatters;
pub mod log_file;
pub mod paths;
pub mod sos;
