//! Standard node library
//!
//! Typed builders for the node kinds the engine runs (method, constructor,
//! factory, input, output) and a small `Mask` artifact library built on them.

mod constructor;
mod factory;
mod input;
pub mod mask;
mod method;
mod output;

pub use constructor::ConstructorNode;
pub use factory::FactoryNode;
pub use input::InputNode;
pub use mask::{register_all, Mask, MaskError, MaskSetupError};
pub use method::MethodNode;
pub use output::OutputNode;
