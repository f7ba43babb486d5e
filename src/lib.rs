pub mod calibration;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod monitor;
pub mod output;
pub mod pipeline;
pub mod preprocess;
pub mod sources;
pub mod stabilizer;
pub mod transport;

#[cfg(feature = "camera")]
pub mod camera;
