pub mod belief_filter;
pub mod channel_buffer;
pub mod classifier;
pub mod config;
pub mod csv_loader;
pub mod debouncer;
pub mod error;
pub mod frame_decoder;
pub mod labels;
pub mod link;
pub mod orientation;
pub mod pipeline;
pub mod recorder;
pub mod rotation_segmenter;
pub mod serial_parser;
pub mod session;
pub mod types;

#[cfg(feature = "bluez")]
pub mod ble;
