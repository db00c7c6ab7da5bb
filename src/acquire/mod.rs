// Acquisition pipeline: find barometers, bring them to the desired configuration, sample them.
pub mod configure;
pub mod discovery;
pub mod scheduler;
