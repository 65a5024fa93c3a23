pub mod error;
pub mod feed;
pub mod remote;
pub mod reshape;
pub mod source;
pub mod view;

pub use error::{describe_failure, error_code, SourceError};
pub use feed::{ConnectionFeed, FeedEvent, FeedPhase, FeedSnapshot, ReloadOutcome};
pub use remote::RemoteSource;
pub use reshape::{reshape, Connection, Counterparty};
pub use source::{ChangeNotice, ChangeStream, ConnectionSource, LocalSource};
pub use view::{
    ActionOutcome, ActionTicket, Affordance, BulkReport, BulkTicket, ConfirmDialog,
    ConnectionAction, ConnectionTab, ConnectionsView, Intent, Priority, Toast, ToastKind,
};

#[cfg(test)]
#[path = "tests/test_support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/reshape_tests.rs"]
mod reshape_tests;
