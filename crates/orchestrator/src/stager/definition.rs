use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::context::{CallbackSignal, DataMessage, HookError, Properties, StepContext};
use crate::rules::AdvancementRule;
use crate::thresholds::ParticipantThresholds;

/// Enter/exit hook, plan init and teardown, threshold callbacks.
pub type HookFn = Arc<dyn Fn(&mut StepContext<'_>) -> Result<(), HookError> + Send + Sync>;

/// The callback that plays a step.
pub type StepFn =
    Arc<dyn Fn(&mut StepContext<'_>) -> Result<CallbackSignal, HookError> + Send + Sync>;

/// Receives a message that arrives while the session is paused.
pub type MessageFn =
    Arc<dyn Fn(&mut StepContext<'_>, &DataMessage) -> Result<(), HookError> + Send + Sync>;

/// Receives the messages buffered during a pause, on resume.
pub type ReplayFn =
    Arc<dyn Fn(&mut StepContext<'_>, Vec<DataMessage>) -> Result<(), HookError> + Send + Sync>;

/// Predicate of a `loop`/`doLoop` entry, evaluated at navigation time.
pub type LoopCondition = Arc<dyn Fn() -> bool + Send + Sync>;

/// Chooses a stage id in flexible mode. `None` as input means "before the
/// first stage"; `None` as output means the sequence ends.
pub type NextStageFn = Arc<dyn Fn(Option<&str>) -> Option<String> + Send + Sync>;

pub fn hook(
    f: impl Fn(&mut StepContext<'_>) -> Result<(), HookError> + Send + Sync + 'static,
) -> HookFn {
    Arc::new(f)
}

pub fn callback(
    f: impl Fn(&mut StepContext<'_>) -> Result<CallbackSignal, HookError> + Send + Sync + 'static,
) -> StepFn {
    Arc::new(f)
}

/// A step that finishes as soon as it is played.
pub fn done_callback() -> StepFn {
    Arc::new(|_: &mut StepContext<'_>| Ok(CallbackSignal::Done))
}

fn placeholder_callback() -> StepFn {
    Arc::new(|_: &mut StepContext<'_>| Ok(CallbackSignal::Continue))
}

#[derive(Clone)]
pub struct StepDef {
    pub id: String,
    pub callback: StepFn,
    pub init: Option<HookFn>,
    pub exit: Option<HookFn>,
    pub rule: Option<AdvancementRule>,
    pub properties: Properties,
    pub globals: Properties,
    pub thresholds: Option<ParticipantThresholds>,
    pub on_pause_message: Option<MessageFn>,
    pub on_resume: Option<ReplayFn>,
    pub on_timeout: Option<HookFn>,
    pub(crate) synthetic: bool,
}

impl StepDef {
    pub fn new(
        id: impl Into<String>,
        callback: impl Fn(&mut StepContext<'_>) -> Result<CallbackSignal, HookError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::with_callback(id, Arc::new(callback))
    }

    pub fn with_callback(id: impl Into<String>, callback: StepFn) -> Self {
        Self {
            id: id.into(),
            callback,
            init: None,
            exit: None,
            rule: None,
            properties: Properties::new(),
            globals: Properties::new(),
            thresholds: None,
            on_pause_message: None,
            on_resume: None,
            on_timeout: None,
            synthetic: false,
        }
    }

    pub(crate) fn placeholder(id: impl Into<String>) -> Self {
        let mut def = Self::with_callback(id, placeholder_callback());
        def.synthetic = true;
        def
    }

    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn with_init(mut self, hook: HookFn) -> Self {
        self.init = Some(hook);
        self
    }

    pub fn with_exit(mut self, hook: HookFn) -> Self {
        self.exit = Some(hook);
        self
    }

    pub fn with_rule(mut self, rule: impl Into<AdvancementRule>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    pub fn with_thresholds(mut self, thresholds: ParticipantThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    /// Deadline for the step in milliseconds.
    pub fn with_timer(self, millis: u64) -> Self {
        self.with_property("timer", Value::from(millis))
    }

    /// Frame the presenter loads before the callback runs.
    pub fn with_frame(self, frame: impl Into<String>) -> Self {
        self.with_property("frame", Value::String(frame.into()))
    }

    pub fn on_pause_message(mut self, handler: MessageFn) -> Self {
        self.on_pause_message = Some(handler);
        self
    }

    pub fn on_resume(mut self, handler: ReplayFn) -> Self {
        self.on_resume = Some(handler);
        self
    }

    pub fn on_timeout(mut self, hook: HookFn) -> Self {
        self.on_timeout = Some(hook);
        self
    }
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("id", &self.id)
            .field("rule", &self.rule)
            .field("properties", &self.properties)
            .field("globals", &self.globals)
            .field("thresholds", &self.thresholds)
            .field("synthetic", &self.synthetic)
            .finish_non_exhaustive()
    }
}

/// Partial update for an existing step. Unset fields are kept; property
/// maps are merged key by key.
#[derive(Clone, Default)]
pub struct StepPatch {
    pub callback: Option<StepFn>,
    pub init: Option<HookFn>,
    pub exit: Option<HookFn>,
    pub rule: Option<AdvancementRule>,
    pub properties: Properties,
    pub globals: Properties,
    pub thresholds: Option<ParticipantThresholds>,
    pub on_pause_message: Option<MessageFn>,
    pub on_resume: Option<ReplayFn>,
    pub on_timeout: Option<HookFn>,
}

impl StepPatch {
    pub(crate) fn apply(self, def: &mut StepDef) {
        if let Some(callback) = self.callback {
            def.callback = callback;
            def.synthetic = false;
        }
        if self.init.is_some() {
            def.init = self.init;
        }
        if self.exit.is_some() {
            def.exit = self.exit;
        }
        if self.rule.is_some() {
            def.rule = self.rule;
        }
        def.properties.extend(self.properties);
        def.globals.extend(self.globals);
        if self.thresholds.is_some() {
            def.thresholds = self.thresholds;
        }
        if self.on_pause_message.is_some() {
            def.on_pause_message = self.on_pause_message;
        }
        if self.on_resume.is_some() {
            def.on_resume = self.on_resume;
        }
        if self.on_timeout.is_some() {
            def.on_timeout = self.on_timeout;
        }
    }
}

#[derive(Clone)]
pub struct StageDef {
    pub id: String,
    pub steps: Vec<String>,
    /// Inline form: the stage is a single step playing this callback.
    /// Mutually exclusive with `steps`.
    pub callback: Option<StepFn>,
    pub init: Option<HookFn>,
    pub exit: Option<HookFn>,
    pub rule: Option<AdvancementRule>,
    pub properties: Properties,
    pub globals: Properties,
    pub thresholds: Option<ParticipantThresholds>,
    pub(crate) inline: bool,
}

impl StageDef {
    /// A stage without steps. It gets a placeholder step until real steps
    /// are sequenced into it.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            callback: None,
            init: None,
            exit: None,
            rule: None,
            properties: Properties::new(),
            globals: Properties::new(),
            thresholds: None,
            inline: false,
        }
    }

    pub fn with_steps<I, S>(id: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut def = Self::new(id);
        def.steps = steps.into_iter().map(Into::into).collect();
        def
    }

    pub fn inline(id: impl Into<String>, callback: StepFn) -> Self {
        let mut def = Self::new(id);
        def.callback = Some(callback);
        def
    }

    pub fn is_inline(&self) -> bool {
        self.inline
    }

    pub fn with_init(mut self, hook: HookFn) -> Self {
        self.init = Some(hook);
        self
    }

    pub fn with_exit(mut self, hook: HookFn) -> Self {
        self.exit = Some(hook);
        self
    }

    pub fn with_rule(mut self, rule: impl Into<AdvancementRule>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.insert(name.into(), value);
        self
    }

    pub fn with_thresholds(mut self, thresholds: ParticipantThresholds) -> Self {
        self.thresholds = Some(thresholds);
        self
    }
}

impl fmt::Debug for StageDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDef")
            .field("id", &self.id)
            .field("steps", &self.steps)
            .field("inline", &self.inline)
            .field("rule", &self.rule)
            .field("properties", &self.properties)
            .field("globals", &self.globals)
            .finish_non_exhaustive()
    }
}

/// Partial update for an existing stage. There is no callback field: the
/// inline form can only be chosen when the stage is first declared.
#[derive(Clone, Default)]
pub struct StagePatch {
    pub steps: Option<Vec<String>>,
    pub init: Option<HookFn>,
    pub exit: Option<HookFn>,
    pub rule: Option<AdvancementRule>,
    pub properties: Properties,
    pub globals: Properties,
    pub thresholds: Option<ParticipantThresholds>,
}

impl StagePatch {
    pub fn steps<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            steps: Some(steps.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub(crate) fn apply(self, def: &mut StageDef) {
        if let Some(steps) = self.steps {
            def.steps = steps;
            def.inline = false;
        }
        if self.init.is_some() {
            def.init = self.init;
        }
        if self.exit.is_some() {
            def.exit = self.exit;
        }
        if self.rule.is_some() {
            def.rule = self.rule;
        }
        def.properties.extend(self.properties);
        def.globals.extend(self.globals);
        if self.thresholds.is_some() {
            def.thresholds = self.thresholds;
        }
    }
}
