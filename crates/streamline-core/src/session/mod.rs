//! Session isolation and stream job lifecycle

mod cancellation;
mod coordinator;
mod isolation;
pub mod store;

pub use cancellation::{CancellationReason, StreamCancellation};
pub use coordinator::{
    CancellationCoordinator, StreamOutcome, StreamRequest, UiUpdate, UiUpdateKind,
};
pub use isolation::{SessionIsolationManager, StreamChannel};
pub use store::{InMemoryMessageStore, MessageRecord, MessageStore, StoreError};
