//! The instrumentation passes.
//!
//! Each pass implements [`Pass`] and mutates the parsed module in place.
//! The driver runs them in a fixed order (trace, then alloc with the
//! escape analysis, then bounds, then vtable) and emits the runtime-config
//! globals last so
//! calls inserted by earlier passes observe the final configuration at
//! runtime.

mod alloc;
mod bounds;
mod common;
mod config;
mod escape;
mod optnone;
mod pass;
mod trace;
mod vtable;

pub use alloc::{AllocKind, AllocPass};
pub use bounds::BoundsPass;
pub use common::{format_site, should_instrument, SiteInterner};
pub use config::{extract_runtime_config, ConfigPass, RuntimeConfig};
pub use escape::{EscapeState, ReturnAllocators};
pub use optnone::OptNonePass;
pub use pass::Pass;
pub use trace::TracePass;
pub use vtable::VtablePass;
