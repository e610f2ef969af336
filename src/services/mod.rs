//! External collaborator surfaces for TASKER.
//!
//! Everything the core engine delegates to the outside world lives here:
//! the per-run log sink, the project summary appender, recovery state
//! persistence, host-reachability probes, the machine-readable JSON
//! report, and the terminal-failure alert hook.
//!
//! # Modules
//!
//! - `logging` - per-run log file sink and the workflow observer wiring
//! - `summary` - append-only project summary records
//! - `recovery` - resumable execution state (`--auto-recovery`)
//! - `hosts` - host and command probes backing validation layer L4
//! - `json_output` - machine-parseable run report (`--output-json`)
//! - `alert` - alert hook invoked on terminal workflow failure
pub mod alert;
pub mod hosts;
pub mod json_output;
pub mod logging;
pub mod recovery;
pub mod summary;
