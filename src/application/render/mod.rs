//! Snapshot rendering through an external headless browser.
//!
//! [`Renderer`] is the seam between the dispatcher and the process that turns
//! a URL into an image. [`ProcessRenderer`] is the production implementation;
//! [`InFlightRenders`] makes sure a key is rendered by at most one caller at a
//! time.

mod inflight;
mod process;
mod types;

pub use inflight::{Claim, InFlightRenders, RenderLease, await_outcome};
pub use process::ProcessRenderer;
pub use types::{RenderFailure, RenderJob, RenderOutcome, Renderer};
