//! Sweep control: trial planning, device leasing and dispatch.

pub mod device;
mod dispatch;
pub mod plan;
pub mod trial;

pub use device::{Device, DeviceLease, DevicePool};
pub use dispatch::{ControllerOptions, SweepController, TrialStream, derive_freeze};
pub use plan::{PlannedTrial, TrialPlan};
pub use trial::{SweepSummary, TrialKey, TrialResult, TrialState, TrialStatus};
