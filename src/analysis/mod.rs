/// Windowed statistics over tank history.
///
/// Submodules:
/// - `window`: the rolling sample buffer and shared windowing helpers.
/// - `gph`: median fill rates split by override valve position.

pub mod gph;
pub mod window;
