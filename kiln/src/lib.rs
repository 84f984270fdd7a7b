//! # Kiln - Model Based Document Store Access
//!
//! Kiln is a thin, safety focused layer over a document database. Models are
//! plain serde structs described by a static [`Meta`](model::Meta); a
//! [`Manager`] per model performs checked CRUD operations with optimistic
//! locking and transactional guarantees, and a [`ChangeStream`] turns the
//! change feed of a collection into resumable model events.
//!
//! ## Key Features
//!
//! - **Typed models**: `#[derive(Model)]` generates the model descriptor
//! - **Locking**: lock counters fence transactions against concurrent writers
//! - **Transactions**: `Store::with_transaction` with snapshot isolation
//! - **Change streams**: resumable, lock-noise free change events
//! - **Driver seam**: driver traits with a bundled in-memory engine
//!
//! ## Quick Start
//!
//! ```rust
//! use kiln::context::Context;
//! use kiln::model::{Base, Validate};
//! use kiln::{Flags, Model, Store};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Model, Serialize, Deserialize, Default, Debug)]
//! #[model(collection = "posts")]
//! struct Post {
//!     #[serde(flatten)]
//!     base: Base,
//!     title: String,
//! }
//!
//! impl Validate for Post {}
//!
//! # fn main() -> kiln::errors::KilnResult<()> {
//! let store = Store::connect("memory:///blog")?;
//! let posts = store.m::<Post>();
//! let ctx = Context::background();
//!
//! let mut post = Post { title: "Hello".to_string(), ..Default::default() };
//! posts.insert(&ctx, &mut post, Flags::empty())?;
//!
//! let locked: Option<Post> = store.with_transaction(&ctx, |ctx| {
//!     posts.find(ctx, post.id(), true, Flags::empty())
//! })?;
//! assert_eq!(locked.map(|post| post.base.lock), Some(1));
//!
//! store.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Pattern
//!
//! Store, Manager and Collection follow the PIMPL pattern: the public type
//! holds an `Arc` of its private state, so clones are cheap and share the
//! same caches and connections.
//!
//! ## Module Organization
//!
//! - [`store`] - Store, caches and transactions
//! - [`manager`] - Checked model operations
//! - [`iterator`] - Model and projection iterators
//! - [`stream`] - Change streams
//! - [`collection`] - Logged raw collection access
//! - [`driver`] - Driver traits and options
//! - [`engine`] - In-memory engine
//! - [`translator`] - Filter and field name translation
//! - [`model`], [`id`], [`document`], [`flags`], [`context`] - Core types
//! - [`tester`] - Test fixtures
//! - [`errors`] - Error types and result definitions

extern crate self as kiln;

pub mod collection;
pub mod context;
pub mod document;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod flags;
pub mod id;
pub mod iterator;
pub mod manager;
pub mod model;
pub mod store;
pub mod stream;
pub mod tester;
pub mod translator;

pub use errors::{is_conflict, is_duplicate, is_missing, is_stop, ErrorKind, KilnError, KilnResult};
pub use flags::Flags;
pub use id::ID;
pub use kiln_derive::Model;
pub use manager::Manager;
pub use model::Model;
pub use store::Store;
pub use stream::{ChangeStream, Event, EventKind, StreamOptions};

#[doc(hidden)]
pub use once_cell;
#[doc(hidden)]
pub use serde_json;

#[cfg(test)]
#[ctor::ctor]
fn init_logging() {
    colog::init();
}
