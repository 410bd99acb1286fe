//! Session model and publish state machine.

pub mod ledger;
pub mod model;
pub mod service;

pub use ledger::{idempotency_key, CreditLedger, NoopLedger, ACTION_PUBLISH};
pub use model::{PublishSession, SessionStatus, WorkerContext};
pub use service::{
    AttestReceipt, FinalizeOutcome, InitiateReceipt, InitiateRequest, PublishService,
    UpdateReceipt,
};

#[cfg(test)]
mod tests;
