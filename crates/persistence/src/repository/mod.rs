//! Repository implementations for database operations

pub mod asset;
pub mod chain;
pub mod costbasis;
pub mod entity;
pub mod event;
pub mod flag;
pub mod ledger;
pub mod logical;
pub mod setting;

pub use asset::*;
pub use chain::*;
pub use costbasis::*;
pub use entity::*;
pub use event::*;
pub use flag::*;
pub use ledger::*;
pub use logical::*;
pub use setting::*;
