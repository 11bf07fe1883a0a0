pub mod breaker;
pub mod evaluator;
pub mod evidence;
pub mod kill_switch;
pub mod marker;
pub mod monitor;

pub use breaker::{BreakerState, CircuitBreaker, ResetOutcome, TripInfo, TripOutcome};
pub use evidence::{EvidenceLogger, EvidenceRecord};
pub use kill_switch::KillSwitch;
pub use marker::{MarkerRecord, MarkerState, MarkerStore};
pub use monitor::{CycleReport, RiskMonitor};
