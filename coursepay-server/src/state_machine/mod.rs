//! Explicit state machine for the payment intent lifecycle.
//!
//! This module implements a pure functional state machine for payment
//! reconciliation. The design separates:
//! - **State**: what the system knows (`PaymentIntent`, `PaymentState`)
//! - **Events**: what the provider said happened (`PaymentEvent`)
//! - **Effects**: what must happen as a result (`Effect`)
//! - **Transition**: pure function `(Intent, Event) -> (Intent, Vec<Effect>)`
//!
//! The reconciler executes effects against the repository; the writes that
//! accompany a completion commit in the same storage transaction as the
//! state change.

pub mod effect;
pub mod event;
pub mod state;
pub mod transition;

pub use effect::*;
pub use event::*;
pub use state::*;
pub use transition::*;
