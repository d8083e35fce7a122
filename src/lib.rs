mod attribute_value;
mod audit;
mod bucket;
mod client;
mod clock;
mod condition;
mod config;
mod context;
mod cron;
mod error;
mod eval;
mod management;
mod provider;
mod ruleset;
mod schedule;
mod segment;
mod snapshot;
mod targeting;
mod test_common;
mod util;

pub use attribute_value::*;
pub use audit::*;
pub use bucket::*;
pub use client::*;
pub use clock::*;
pub use condition::*;
pub use config::*;
pub use context::*;
pub use cron::*;
pub use error::*;
pub use eval::*;
pub use management::*;
pub use provider::*;
pub use ruleset::*;
pub use schedule::*;
pub use segment::*;
pub use snapshot::*;
pub use targeting::*;
