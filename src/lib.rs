/// Water tank monitoring and override valve control.
///
/// Each tick a snapshot of the tank level, pressure switch, float switch
/// and relay board goes through the alert detectors and the override
/// controller; events go to the dispatchers and all idempotency state is
/// saved to a single JSON file.

pub mod alert;
pub mod analysis;
pub mod config;
pub mod control;
pub mod db;
pub mod dev_mode;
pub mod engine;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod notify;
pub mod relay;
pub mod state;
