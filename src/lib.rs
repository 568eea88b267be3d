//! `stowdb` is a persistent content-addressed key-value engine.
//!
//! It composes two layers behind one API: a small **root** key/value
//! store holding named mutable cells, and an immutable **stowage**
//! store where blobs are keyed by a secure hash of their contents.
//! Stowed blobs may textually mention other hashes; those mentions form
//! a reference graph that is kept alive by persistent refcounts and an
//! in-memory ephemeron table, and reclaimed by conservative garbage
//! collection.
//!
//! ## Getting started
//!
//! ```no_run
//! use stowdb::{Db, OpenOptions};
//!
//! # fn run() -> stowdb::error::CResult<()> {
//! let db = Db::open("/tmp/stowdb-example", OpenOptions::default())?;
//! let mut tx = db.begin()?;
//!
//! let h = tx.stow(b"hello world")?;
//! tx.write(b"greeting", h.as_bytes().to_vec())?;
//! assert!(tx.commit()?);
//!
//! let mut tx2 = db.begin()?;
//! let root = tx2.read(b"greeting")?;
//! let root_hash = stowdb::hash::Hash::from_bytes(&root)?;
//! assert_eq!(tx2.load(&root_hash)?.as_deref(), Some(&b"hello world"[..]));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod hash;
pub mod key;
pub mod backend;
pub mod refcount;
pub mod ephemeron;
pub mod frame;
pub mod tx;
pub mod writer;
pub mod db;

pub use db::{Db, OpenOptions};
pub use error::{CResult, Error};
pub use hash::Hash;
pub use tx::Transaction;
