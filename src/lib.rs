#![forbid(unsafe_code)]
//! Build-artifact distribution and sharded test dispatch.
//!
//! The pipeline this crate implements:
//!
//! 1. A platform-conditioned manifest ([`manifest`]) is resolved for one
//!    configuration into a command and a set of files.
//! 2. The files are hashed into an `.isolated` file ([`isolated`]).
//! 3. Inputs and the `.isolated` file are uploaded to a content-addressed
//!    store ([`storage`]), skipping whatever the server already has.
//! 4. Shards of a task referencing the `.isolated` file are triggered on a
//!    scheduler and their results collected ([`dispatch`]).
//!
//! [`commands`] wires these steps into the operations a front end exposes.
//! Everything runs on plain threads ([`threading`]); network access goes
//! through the [`net::Transport`] trait.
//!
//! ```no_run
//! use isoshard::commands::{self, CheckOptions};
//! use isoshard::config::Settings;
//! use isoshard::storage::Storage;
//!
//! fn main() -> Result<(), isoshard::IsolateError> {
//!     let settings = Settings::default().apply_env()?;
//!     let storage = Storage::new(
//!         settings.isolate_client()?,
//!         settings.workers,
//!         settings.max_retries,
//!     )?;
//!
//!     let options = CheckOptions {
//!         manifest: "out/unit_tests.isolate".into(),
//!         ..CheckOptions::default()
//!     };
//!     let digest = commands::archive(&options, &storage)?;
//!     println!("{digest}");
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod core;
pub mod dispatch;
mod error;
pub mod isolated;
#[cfg(feature = "logging")]
pub mod logging;
pub mod manifest;
pub mod net;
pub mod paths;
pub mod storage;
pub mod threading;
mod utils;

pub use crate::core::{Digest, HashAlgo, Namespace};
pub use crate::error::*;
pub use crate::isolated::{Isolated, IsolatedBuild};
pub use crate::manifest::{Configs, ResolvedConfig};
pub use crate::storage::Storage;
