#![doc = include_str!("../README.md")]

mod error;
mod http;
mod redis_kv;
mod rows;
mod types;

pub use crate::error::*;
pub use crate::http::*;
pub use crate::redis_kv::*;
pub use crate::rows::*;
pub use crate::types::*;
