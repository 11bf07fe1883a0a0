pub mod decision;
pub mod telemetry;

pub use decision::{Decision, DirectiveAction, LiquidationDirective, TripReason, Violation};
pub use telemetry::{RawTelemetry, TelemetrySnapshot};
