//! Loss recovery and congestion control (RFC 9002).

mod congestion;
mod rtt;

pub use congestion::Congestion;
pub use rtt::RttEstimator;
