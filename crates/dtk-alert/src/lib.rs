//! Alert evaluation and dispatch for driftkit
//!
//! The evaluator turns fresh detection rows into at most one alert event
//! per run (consecutive confirmation, multi-detector agreement, cooldown);
//! the dispatcher renders the event through a template and delivers it to
//! every configured channel.

pub mod dispatcher;
pub mod evaluator;
pub mod event;
pub mod templates;

pub use dispatcher::{AlertDispatcher, ChannelDelivery, EmailTransport, LogEmailTransport};
pub use evaluator::AlertEvaluator;
pub use event::{render_local_time, AlertEvent, AlertKind};
pub use templates::{
    DEFAULT_TEMPLATE_CONSECUTIVE, DEFAULT_TEMPLATE_NO_DATA, DEFAULT_TEMPLATE_SINGLE,
};
