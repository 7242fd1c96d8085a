//! Capabilities the agent can invoke inside its sandbox.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use registry::{
    CAPABILITIES, Capability, CapabilityRegistry, InvocationError, ToolInvocation, find_spec,
};
pub use tool::{CapabilitySpec, MAX_OUTPUT_SIZE, ParamSpec, ToolContext, ToolError};
