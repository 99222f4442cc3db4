pub mod repositories;
pub mod types;

pub use repositories::{
    MessageError, MessageRepository, ProjectError, ProjectRepository, SessionError,
    SessionRepository, SessionSummary, ToolCallError, ToolCallRepository, TriggerError,
    TriggerRepository,
};
pub use types::{
    Message, MessageRole, NewMessage, NewProject, NewRuleTrigger, NewSession, NewToolCall,
    Project, RuleTrigger, Session, SessionStatus, ToolCall,
};
