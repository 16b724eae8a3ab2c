//! Core types for the Tether actor substrate.
//!
//! This is the leaf crate with zero internal dependencies. It defines the
//! pieces every actor is built from: [`Identity`] and [`ThreadToken`],
//! the [`ThreadOwnable`] ownership token, the [`Event`]/[`Message`] family
//! with its [`Payload`] contract, the [`EventDispatcher`], and the error
//! types shared across the workspace.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod dispatcher;
pub mod error;
pub mod event;
pub mod id;
pub mod ownable;

pub use dispatcher::{Callback, EventDispatcher, Priority, SubscriptionId};
pub use error::{
    AcquireError, LinkError, NotLinkedError, NotSubscribedError, OwnershipError, StartError,
};
pub use event::{Dispatch, Event, EventKind, Message, Payload};
pub use id::{Identity, ThreadToken};
pub use ownable::ThreadOwnable;
