pub mod dispatcher;
pub mod failure_tracker;
pub mod queues;

pub use dispatcher::Dispatcher;
pub use failure_tracker::FailureTracker;
pub use queues::{CompletionReport, DispatchQueues, FailureReport, FrameReport, SubmitRequest};
