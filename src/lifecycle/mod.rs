pub mod appointment;
pub mod validation;

pub use appointment::{AppointmentTransition, available_targets};
pub use validation::{ReviewDecision, Submission};
