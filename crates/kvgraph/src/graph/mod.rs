//! Graph IR, construction and the model recipes.

mod builder;
mod config;
mod ir;
pub mod recipes;
pub mod topology;

pub use builder::GraphBuilder;
pub use config::GraphConfig;
pub use ir::{Graph, Node, NodeId, ValueId, ValueInfo, ValueRole};
pub use recipes::{AttnOutput, ModelHead};
pub use topology::Schedule;
