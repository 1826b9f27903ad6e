//! k2s Windows host helpers
//!
//! Support code for the native pieces k2s injects into, or loads beside,
//! Windows networking processes.
//!
//! # Components
//!
//! - **Compartment switching** - move the calling thread, or every thread of
//!   the host process via APCs, into a network compartment
//! - **Diagnostic log** - optional UTF-16LE trace file driven by
//!   `COMPARTMENT_HOOK_LOGFILE`
//! - **VFP rules** - marshal PA route rules for `vfpapi.dll`
//!
//! # Example
//!
//! ```no_run
//! use k2s_winhelpers::vfp::RouteRule;
//!
//! let rule = RouteRule::parse(
//!     "to-master",
//!     "KubeSwitch",
//!     "6f1d7b5c-44a1-4b7e-9d7b-3c2f3a5e9f01",
//!     "172.19.1.0/24",
//!     "00-15-5D-0A-BC-FF",
//!     100,
//! )?;
//! let bytes = rule.rule_data().encode()?;
//! assert_eq!(bytes.len(), 1188);
//! # Ok::<(), k2s_winhelpers::Error>(())
//! ```

pub mod compartment;
pub mod config;
pub mod error;
pub mod logging;
pub mod vfp;

pub use compartment::CompartmentId;
pub use config::HookConfig;
pub use error::{Error, Result};
pub use logging::{DiagnosticLog, ProcessLog};
