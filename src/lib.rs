pub mod calibration;
pub mod codec;
pub mod error;
pub mod estimator;
pub mod freq;
pub mod processor;
pub mod sdft;
pub mod server;
pub mod settings;
pub mod source;
pub mod types;
