//! Scripts: ordered, multi-prompt surveys.
//!
//! A run walks the prompts in order on a dedicated worker thread, waiting for
//! each to answer before asking the next, then reports every response to the
//! completion callback. Prompts already complete are skipped, so a rerun only
//! asks what is still unanswered.

use crate::probe::Datum;
use crate::script::prompt::{Prompt, PromptContext, PromptInput, PromptRecord};
use crate::script::scheduler::{CancellationToken, ScheduleHandle, ScheduledCallback, Scheduler};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Notification shown when a scheduled script fires.
pub const USER_NOTIFICATION_MESSAGE: &str = "Your input is requested.";

/// Label scheduled script occurrences are registered under.
pub const RUN_LABEL: &str = "Run Script";

/// Script errors.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to parse script: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
struct RunState {
    first_run_timestamp: Option<DateTime<Utc>>,
    previous_datum: Option<Datum>,
    current_datum: Option<Datum>,
}

/// One schedulable survey instance.
#[derive(Debug)]
pub struct Script {
    id: String,
    name: String,
    delay: Duration,
    prompt_timeout: Option<Duration>,
    prompts: Vec<Prompt>,
    state: Mutex<RunState>,
    run_lock: Mutex<()>,
}

impl Script {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_delay(name, Duration::ZERO)
    }

    pub fn with_delay(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            delay,
            prompt_timeout: None,
            prompts: Vec::new(),
            state: Mutex::new(RunState::default()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Delay between scheduling a run and its start.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    pub fn prompt_timeout(&self) -> Option<Duration> {
        self.prompt_timeout
    }

    /// Bound how long a run waits on each prompt. `None` waits indefinitely.
    pub fn set_prompt_timeout(&mut self, timeout: Option<Duration>) {
        self.prompt_timeout = timeout;
    }

    pub fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    pub fn add_prompt(&mut self, prompt: Prompt) {
        self.prompts.push(prompt);
    }

    pub fn remove_prompt(&mut self, id: &str) -> Option<Prompt> {
        let index = self.prompts.iter().position(|prompt| prompt.id() == id)?;
        Some(self.prompts.remove(index))
    }

    /// True when there are no prompts or every prompt is complete.
    pub fn is_complete(&self) -> bool {
        self.prompts.iter().all(Prompt::is_complete)
    }

    /// When this instance first ran, if it has.
    pub fn first_run_timestamp(&self) -> Option<DateTime<Utc>> {
        self.state.lock().first_run_timestamp
    }

    pub fn previous_datum(&self) -> Option<Datum> {
        self.state.lock().previous_datum.clone()
    }

    pub fn current_datum(&self) -> Option<Datum> {
        self.state.lock().current_datum.clone()
    }

    /// Deep copy for a new occurrence: fresh id, no run state, no prompt completion.
    pub fn copy(&self) -> Script {
        Script {
            id: Uuid::new_v4().to_string(),
            name: self.name.clone(),
            delay: self.delay,
            prompt_timeout: self.prompt_timeout,
            prompts: self.prompts.iter().map(Prompt::fresh_copy).collect(),
            state: Mutex::new(RunState::default()),
            run_lock: Mutex::new(()),
        }
    }

    /// Run every incomplete prompt in order, blocking on each, and return the responses.
    ///
    /// Triggering data replace the stored ones only when supplied, so a rerun
    /// keeps the context of the first trigger.
    pub fn run(
        &self,
        input: &dyn PromptInput,
        previous_datum: Option<Datum>,
        current_datum: Option<Datum>,
    ) -> Vec<Datum> {
        let _run = self.run_lock.lock();
        info!(script = %self.name, "Running script");

        let context = {
            let mut state = self.state.lock();

            let (first_run_timestamp, is_rerun) = match state.first_run_timestamp {
                Some(first) => (first, true),
                None => {
                    let now = Utc::now();
                    state.first_run_timestamp = Some(now);
                    (now, false)
                }
            };

            if previous_datum.is_some() {
                state.previous_datum = previous_datum;
            }
            if current_datum.is_some() {
                state.current_datum = current_datum;
            }

            PromptContext {
                script_id: self.id.clone(),
                previous_datum: state.previous_datum.clone(),
                current_datum: state.current_datum.clone(),
                is_rerun,
                first_run_timestamp,
            }
        };

        let mut data = Vec::new();
        for prompt in self.prompts.iter().filter(|prompt| !prompt.is_complete()) {
            let (tx, rx) = bounded(1);
            let prompt_name = prompt.name().to_string();
            prompt.ask(input, context.clone(), move |datum| {
                if tx.send(datum).is_err() {
                    debug!(prompt = %prompt_name, "Run moved on; response left for a rerun");
                }
            });

            let outcome = match self.prompt_timeout {
                Some(timeout) => rx.recv_timeout(timeout),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            // A late answer must not mark the prompt complete once the run stops waiting.
            drop(rx);

            match outcome {
                Ok(Some(datum)) => {
                    prompt.mark_complete();
                    data.push(datum);
                }
                Ok(None) => debug!(script = %self.name, prompt = prompt.name(), "Prompt produced no response"),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(script = %self.name, prompt = prompt.name(), "Timed out waiting for prompt")
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(script = %self.name, prompt = prompt.name(), "Prompt never reported completion")
                }
            }
        }

        info!(script = %self.name, responses = data.len(), "Script has finished running");
        data
    }

    /// Schedule a run after this script's delay.
    ///
    /// When the occurrence fires, the run executes on its own worker thread and
    /// `on_complete` receives the responses from that thread.
    pub fn run_async(
        self: &Arc<Self>,
        scheduler: &dyn Scheduler,
        input: Arc<dyn PromptInput>,
        previous_datum: Option<Datum>,
        current_datum: Option<Datum>,
        on_complete: impl FnOnce(Vec<Datum>) + Send + 'static,
    ) -> ScheduleHandle {
        let script = Arc::clone(self);

        let callback: ScheduledCallback = Box::new(move |token: CancellationToken| {
            if token.is_cancelled() {
                return;
            }

            let spawned = thread::Builder::new().name(worker_name(&script.name)).spawn(move || {
                let data = script.run(input.as_ref(), previous_datum, current_datum);
                on_complete(data);
            });

            if let Err(e) = spawned {
                error!("Failed to spawn script worker: {e}");
            }
        });

        scheduler.schedule_one_time(callback, RUN_LABEL, self.delay, Some(USER_NOTIFICATION_MESSAGE))
    }

    /// Serialize this instance, including its run state.
    pub fn to_json(&self) -> Result<String, ScriptError> {
        Ok(serde_json::to_string_pretty(&ScriptRecord::from(self))?)
    }

    /// Build a runtime instance from its serialized form. The instance gets a new id.
    pub fn from_json(json: &str) -> Result<Script, ScriptError> {
        let record: ScriptRecord = serde_json::from_str(json)?;
        Ok(record.into())
    }

    pub fn save(&self, path: &Path) -> Result<(), ScriptError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Script, ScriptError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }
}

/// Thread names cannot carry NUL bytes, which a deserialized name may contain.
fn worker_name(script_name: &str) -> String {
    format!("script-{}", script_name.replace('\0', ""))
}

/// Load a script template, logging and returning `None` if it is unusable.
pub fn load_template(path: &Path) -> Option<Script> {
    match Script::load(path) {
        Ok(script) => Some(script),
        Err(e) => {
            warn!(path = %path.display(), "Failed to deserialize script: {e}");
            None
        }
    }
}

impl PartialEq for Script {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Script {}

impl Hash for Script {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Serialized form of a script.
#[derive(Debug, Serialize, Deserialize)]
struct ScriptRecord {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    prompt_timeout_ms: Option<u64>,
    #[serde(default)]
    prompts: Vec<PromptRecord>,
    #[serde(default)]
    first_run_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    previous_datum: Option<Datum>,
    #[serde(default)]
    current_datum: Option<Datum>,
}

impl From<&Script> for ScriptRecord {
    fn from(script: &Script) -> Self {
        let state = script.state.lock();
        Self {
            id: Some(script.id.clone()),
            name: script.name.clone(),
            delay_ms: script.delay.as_millis() as u64,
            prompt_timeout_ms: script.prompt_timeout.map(|timeout| timeout.as_millis() as u64),
            prompts: script.prompts.iter().map(PromptRecord::from).collect(),
            first_run_timestamp: state.first_run_timestamp,
            previous_datum: state.previous_datum.clone(),
            current_datum: state.current_datum.clone(),
        }
    }
}

impl From<ScriptRecord> for Script {
    fn from(record: ScriptRecord) -> Self {
        let mut script = Script::with_delay(record.name, Duration::from_millis(record.delay_ms));
        script.prompt_timeout = record.prompt_timeout_ms.map(Duration::from_millis);
        script.prompts = record.prompts.into_iter().map(Prompt::from).collect();
        *script.state.get_mut() = RunState {
            first_run_timestamp: record.first_run_timestamp,
            previous_datum: record.previous_datum,
            current_datum: record.current_datum,
        };
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::DatumKind;
    use crate::script::prompt::{PromptRequest, PromptResponder, ResponseKind};
    use std::collections::VecDeque;

    /// Answers prompts from a queue and records every request.
    #[derive(Default)]
    struct QueuedInput {
        answers: Mutex<VecDeque<Option<&'static str>>>,
        requests: Mutex<Vec<PromptRequest>>,
    }

    impl QueuedInput {
        fn with(answers: &[Option<&'static str>]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    impl PromptInput for QueuedInput {
        fn request(&self, request: PromptRequest, responder: PromptResponder) {
            self.requests.lock().push(request);
            let answer = self.answers.lock().pop_front().flatten();
            // Answer from another thread, as a UI would.
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                responder.respond(answer.map(str::to_string));
            });
        }
    }

    /// Fires callbacks immediately on the calling thread.
    struct ImmediateScheduler;

    impl Scheduler for ImmediateScheduler {
        fn schedule_one_time(
            &self,
            callback: ScheduledCallback,
            label: &str,
            _delay: Duration,
            _user_message: Option<&str>,
        ) -> ScheduleHandle {
            let token = CancellationToken::new();
            callback(token.clone());
            ScheduleHandle::new(label, token)
        }
    }

    /// Never answers and never drops its responders.
    #[derive(Default)]
    struct HoardingInput {
        held: Mutex<Vec<PromptResponder>>,
    }

    impl PromptInput for HoardingInput {
        fn request(&self, _request: PromptRequest, responder: PromptResponder) {
            self.held.lock().push(responder);
        }
    }

    /// Answers every request, but only after `delay`.
    struct SlowInput {
        delay: Duration,
        answer: &'static str,
        asked: Mutex<usize>,
    }

    impl SlowInput {
        fn new(delay: Duration, answer: &'static str) -> Self {
            Self {
                delay,
                answer,
                asked: Mutex::new(0),
            }
        }
    }

    impl PromptInput for SlowInput {
        fn request(&self, _request: PromptRequest, responder: PromptResponder) {
            *self.asked.lock() += 1;
            let (delay, answer) = (self.delay, self.answer);
            thread::spawn(move || {
                thread::sleep(delay);
                responder.respond(Some(answer.to_string()));
            });
        }
    }

    /// Drops every responder without answering.
    struct DroppingInput;

    impl PromptInput for DroppingInput {
        fn request(&self, _request: PromptRequest, _responder: PromptResponder) {}
    }

    fn survey() -> Script {
        let mut script = Script::new("daily");
        script.add_prompt(Prompt::new("outside", "Are you outside?", ResponseKind::YesNo));
        script.add_prompt(Prompt::new("mood", "Mood from 1 to 5?", ResponseKind::Number));
        script.add_prompt(Prompt::new("notes", "Anything else?", ResponseKind::Text));
        script
    }

    fn trigger(meters: f64) -> Datum {
        Datum::new("altitude", DatumKind::Altitude { meters })
    }

    #[test]
    fn test_empty_script_is_complete() {
        assert!(Script::new("empty").is_complete());
        assert!(!survey().is_complete());
    }

    #[test]
    fn test_run_asks_in_order_and_collects_responses() {
        let script = survey();
        let input = QueuedInput::with(&[Some("yes"), Some("4"), Some("fine")]);

        let data = script.run(&input, None, None);

        assert_eq!(data.len(), 3);
        assert!(script.is_complete());
        let asked: Vec<String> = input.requests.lock().iter().map(|r| r.message.clone()).collect();
        assert_eq!(asked, vec!["Are you outside?", "Mood from 1 to 5?", "Anything else?"]);
    }

    #[test]
    fn test_rerun_keeps_first_timestamp_and_skips_complete_prompts() {
        let script = survey();
        let input = QueuedInput::with(&[Some("no"), None, Some("nothing"), Some("2")]);

        let fix = trigger(10.0);
        let first = script.run(&input, None, Some(fix.clone()));
        assert_eq!(first.len(), 2);
        assert!(!script.is_complete());
        let first_run = script.first_run_timestamp().unwrap();

        let second = script.run(&input, None, None);
        assert_eq!(second.len(), 1);
        assert!(script.is_complete());
        assert_eq!(script.first_run_timestamp(), Some(first_run));

        let requests = input.requests.lock();
        assert_eq!(requests.len(), 4);
        assert!(!requests[0].is_rerun);
        assert!(requests[3].is_rerun);
        assert_eq!(requests[3].message, "Mood from 1 to 5?");
        assert_eq!(requests[3].first_run_timestamp, first_run);
        assert_eq!(requests[3].current_datum, Some(fix));
    }

    #[test]
    fn test_supplied_datums_replace_stored_ones() {
        let script = survey();
        let input = QueuedInput::with(&[None, None, None, None, None, None]);
        let first = trigger(1.0);
        let second = trigger(2.0);

        script.run(&input, Some(first.clone()), Some(first.clone()));
        script.run(&input, None, Some(second.clone()));

        assert_eq!(script.previous_datum(), Some(first));
        assert_eq!(script.current_datum(), Some(second));
    }

    #[test]
    fn test_copy_resets_run_state() {
        let script = survey();
        let input = QueuedInput::with(&[Some("yes"), Some("1"), Some("x")]);
        script.run(&input, None, Some(trigger(3.0)));

        let copy = script.copy();
        assert_ne!(copy.id(), script.id());
        assert_ne!(copy, script);
        assert_eq!(copy.prompts().len(), 3);
        assert!(!copy.is_complete());
        assert!(copy.first_run_timestamp().is_none());
        assert!(copy.current_datum().is_none());
        assert!(script.is_complete());
    }

    #[test]
    fn test_json_round_trip_assigns_new_id() {
        let mut script = survey();
        script.set_delay(Duration::from_millis(1500));
        script.set_prompt_timeout(Some(Duration::from_secs(30)));
        script.run(&QueuedInput::with(&[Some("yes"), None, None]), None, None);

        let restored = Script::from_json(&script.to_json().unwrap()).unwrap();
        assert_ne!(restored.id(), script.id());
        assert_eq!(restored.name(), "daily");
        assert_eq!(restored.delay(), Duration::from_millis(1500));
        assert_eq!(restored.prompt_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(restored.first_run_timestamp(), script.first_run_timestamp());
        assert!(restored.prompts()[0].is_complete());
        assert!(!restored.prompts()[1].is_complete());
    }

    #[test]
    fn test_minimal_template_parses() {
        let script = Script::from_json(
            r#"{"name": "checkin", "prompts": [{"id": "p1", "name": "ok", "message": "OK?"}]}"#,
        )
        .unwrap();
        assert_eq!(script.prompts()[0].response_kind(), ResponseKind::Text);
        assert!(script.first_run_timestamp().is_none());
    }

    #[test]
    fn test_bad_template_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Script::load(&path), Err(ScriptError::Parse(_))));
        assert!(load_template(&path).is_none());
        assert!(load_template(&dir.path().join("missing.json")).is_none());

        let good = dir.path().join("good.json");
        survey().save(&good).unwrap();
        assert_eq!(load_template(&good).unwrap().prompts().len(), 3);
    }

    #[test]
    fn test_prompt_timeout_moves_on() {
        let mut script = survey();
        script.set_prompt_timeout(Some(Duration::from_millis(20)));
        let input = HoardingInput::default();

        let data = script.run(&input, None, None);
        assert!(data.is_empty());
        assert_eq!(input.held.lock().len(), 3);
        assert!(!script.is_complete());
    }

    #[test]
    fn test_late_answer_leaves_prompt_for_rerun() {
        let mut script = Script::new("checkin");
        script.add_prompt(Prompt::new("outside", "Are you outside?", ResponseKind::YesNo));
        script.set_prompt_timeout(Some(Duration::from_millis(20)));
        let input = SlowInput::new(Duration::from_millis(80), "yes");

        assert!(script.run(&input, None, None).is_empty());
        // Let the late answer arrive after the run stopped waiting.
        thread::sleep(Duration::from_millis(200));
        assert!(!script.is_complete());

        script.set_prompt_timeout(Some(Duration::from_secs(5)));
        let rerun = script.run(&input, None, None);
        assert_eq!(rerun.len(), 1);
        assert!(script.is_complete());
        assert_eq!(*input.asked.lock(), 2);
    }

    #[test]
    fn test_dropped_responders_do_not_stall_run() {
        let script = survey();

        let data = script.run(&DroppingInput, None, None);

        assert!(data.is_empty());
        assert!(!script.is_complete());
        assert!(script.first_run_timestamp().is_some());
    }

    #[test]
    fn test_worker_name_strips_nul() {
        assert_eq!(worker_name("daily"), "script-daily");
        assert_eq!(worker_name("a\0b"), "script-ab");
    }

    #[test]
    fn test_run_async_with_nul_in_name() {
        let script = Arc::new(Script::from_json(r#"{"name": "a\u0000b", "prompts": []}"#).unwrap());
        let input: Arc<dyn PromptInput> = Arc::new(DroppingInput);
        let (tx, rx) = bounded(1);

        script.run_async(&ImmediateScheduler, input, None, None, move |data| {
            let worker = thread::current().name().map(str::to_string);
            let _ = tx.send((data.len(), worker));
        });

        let (count, worker) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(count, 0);
        assert_eq!(worker.as_deref(), Some("script-ab"));
    }

    #[test]
    fn test_run_async_reports_from_worker_thread() {
        let script = Arc::new(survey());
        let input: Arc<dyn PromptInput> = Arc::new(QueuedInput::with(&[Some("y"), Some("5"), Some("ok")]));
        let (tx, rx) = bounded(1);

        let handle = script.run_async(&ImmediateScheduler, input, None, None, move |data| {
            let worker = thread::current().name().map(str::to_string);
            let _ = tx.send((data.len(), worker));
        });

        let (count, worker) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(handle.label(), RUN_LABEL);
        assert_eq!(count, 3);
        assert_eq!(worker.as_deref(), Some("script-daily"));
    }
}
