//! Stage descriptors, registry, and the opaque handler seam.

mod handler;
mod registry;

pub use handler::{HandlerRegistry, Label, Merge, Passthrough, StageContext, StageError, StageHandler};
pub use registry::{ParamValue, SlotDecl, StageDescriptor, StageRegistry};
