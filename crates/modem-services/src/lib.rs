//! modem-services — the receiver engine: key encoding, report fetching,
//! correlation, decryption, and the coordinator that runs messages.

pub mod coordinator;
pub mod correlator;
pub mod decrypt;
pub mod encoder;
pub mod message_store;
pub mod report_source;
pub mod round;

pub use coordinator::{Coordinator, CoordinatorError, CoordinatorStatus, DecodeDefaults, StartRequest};
pub use decrypt::DecryptPipeline;
pub use encoder::KeyEncoder;
pub use message_store::{MessageNotFound, MessageStore};
pub use report_source::{HttpReportSource, ReportSource, StaticReportSource};
pub use round::{RoundController, RoundResult, RoundSettings};
