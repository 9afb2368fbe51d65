//! Scripts, prompts and the scheduling contract that triggers them.

pub mod prompt;
pub mod scheduler;
#[allow(clippy::module_inception)]
pub mod script;

pub use prompt::{Prompt, PromptContext, PromptInput, PromptRequest, PromptResponder, ResponseKind};
pub use scheduler::{
    CancellationToken, ScheduleHandle, ScheduledCallback, Scheduler, SchedulerError, TokioScheduler,
};
pub use script::{load_template, Script, ScriptError, RUN_LABEL, USER_NOTIFICATION_MESSAGE};
