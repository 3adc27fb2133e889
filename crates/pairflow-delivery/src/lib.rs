//! Delivery of protocol envelopes into agent terminal panes.
//!
//! Panes are an unreliable channel: text can be typed yet never submitted.
//! Every delivery is therefore confirmed by looking for the envelope id in a
//! pane capture, and a periodic sweep re-submits messages left in an input
//! line.

mod config;
mod marker;
mod protocol;
mod reconcile;
mod render;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{
    DeliveryConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_PROMPT_GLYPHS, DEFAULT_SUBMIT_KEY,
    DELIVERY_ATTEMPTS_ENV, PROMPT_GLYPHS_ENV,
};
pub use marker::{classify_marker, last_prompt_line, locate_marker, MarkerLocation, MarkerPosition};
pub use protocol::{
    next_step, Deliverer, DeliveryFailure, DeliveryReport, DeliveryStatus, DeliveryStep,
    PaneSessionLookup,
};
pub use reconcile::{reconcile_stuck_input, ReconcileOutcome, SkipReason};
pub use render::{render_delivery_message, MESSAGE_PREFIX};
pub use transport::{
    pane_target, CommandOutput, PaneTransport, RunOptions, TmuxTransport, TransportError,
    DEFAULT_TMUX_BIN, TMUX_BIN_ENV,
};
