//! Component-action boundary: the trait external actors implement and the
//! registry the dispatcher calls through.

pub mod component;
pub mod registry;

pub use component::{BoxComponentAction, ComponentAction, ComponentActionDyn};
pub use registry::ActionRegistry;
