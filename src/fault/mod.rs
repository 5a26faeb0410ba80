pub mod inject;

pub use inject::FaultPlan;
