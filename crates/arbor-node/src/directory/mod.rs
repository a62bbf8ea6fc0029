//! Replicated client directory.
//!
//! - [`record`] - per-username entry: token-ordered message log, login state
//! - [`registry`] - the username → record map and its mutation verbs

pub mod record;
pub mod registry;

pub use record::{successor, Delivery, LoginState, Message, Record, RecordKind, Token, TOKEN_MAX};
pub use registry::{
    generate_anonymous_username, is_anonymous_username, ClientDirectory, CreatedActivity,
    PendingDelivery, ANONYMOUS_USERNAME,
};
