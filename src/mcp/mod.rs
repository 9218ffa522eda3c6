pub mod correlator;
pub mod framer;
pub mod handshake;
pub mod notifications;
pub mod types;

pub use correlator::RequestCorrelator;
pub use framer::{Frame, Framer, LogLines};
pub use handshake::{HandshakeOrchestrator, Readiness};
pub use notifications::NotificationDispatcher;
pub use types::{
    CapabilitySnapshot, Message, Notification, PromptArgument, PromptDefinition, PromptMessage,
    PromptResult, RequestId, ResourceDefinition, RpcError, ToolCallRequest, ToolCallResponse,
    ToolContent, ToolDefinition,
};
