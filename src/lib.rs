pub mod calibration;
pub mod calibrator;
pub mod config;
pub mod console_display;
pub mod coordinator;
pub mod data_logger;
pub mod error;
pub mod filters;
pub mod fret_tracker;
pub mod inference;
pub mod jsonl_reader;
pub mod notes;
pub mod overlay;
pub mod play_along;
pub mod simulator;
pub mod tuner;
pub mod types;
