//! macy-services — reachability state shared by the probe and the dashboard.

pub mod matrix;
pub mod reachability;

pub use matrix::ReachabilityMatrix;
pub use reachability::{ReachabilitySnapshot, ReachabilityStore};
