#![doc = include_str!("../README.md")]

mod collab;
mod context;
mod error;
mod ident;
mod keys;
mod latch;
mod outcome;
mod poll;
mod pool;
mod reconcile;
mod shard;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod verify;
mod work;

pub use crate::collab::*;
pub use crate::context::*;
pub use crate::error::*;
pub use crate::ident::*;
pub use crate::keys::*;
pub use crate::latch::*;
pub use crate::outcome::*;
pub use crate::poll::*;
pub use crate::pool::*;
pub use crate::reconcile::*;
pub use crate::shard::*;
pub use crate::verify::*;
pub use crate::work::*;
