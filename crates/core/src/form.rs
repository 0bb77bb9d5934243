//! Per-form validation and submission state.
//!
//! A [`FormSession`] is a synchronous state machine. The page shell feeds it
//! input, blur, submit and clock ticks, and renders the [`UiEffect`] values it
//! returns. Only the submit transport is asynchronous.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::events::AppEvent;
use crate::validator::{run_all, Rule};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
pub const MESSAGE_TTL: Duration = Duration::from_secs(5);
pub const RESET_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_SUCCESS_MESSAGE: &str = "Thank you! We'll be in touch soon.";

/// Declaration of a single form field and the validators assigned to it.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl FieldSpec {
    /// Builds a field from validator names, e.g. `["required", "email"]`.
    pub fn new<I, S>(name: impl Into<String>, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            rules: rules.into_iter().map(|r| Rule::parse(r.as_ref())).collect(),
        }
    }
}

/// Per-form behaviour switches.
#[derive(Debug, Clone)]
pub struct FormOptions {
    pub endpoint: String,
    pub debounce: Duration,
    pub reset_on_success: bool,
    pub reset_delay: Duration,
    pub message_ttl: Duration,
}

impl FormOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            debounce: DEFAULT_DEBOUNCE,
            reset_on_success: true,
            reset_delay: RESET_DELAY,
            message_ttl: MESSAGE_TTL,
        }
    }

    pub fn with_reset_on_success(mut self, reset: bool) -> Self {
        self.reset_on_success = reset;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldState {
    Untouched,
    Validating { due: Instant },
    Valid,
    Invalid { message: String },
}

impl FieldState {
    fn class(&self) -> FieldClass {
        match self {
            Self::Untouched => FieldClass::Untouched,
            Self::Validating { .. } => FieldClass::Validating,
            Self::Valid => FieldClass::Valid,
            Self::Invalid { .. } => FieldClass::Invalid,
        }
    }
}

/// CSS state class applied to a field wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    Untouched,
    Validating,
    Valid,
    Invalid,
}

impl FieldClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untouched => "",
            Self::Validating => "is-validating",
            Self::Valid => "is-valid",
            Self::Invalid => "is-invalid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormPhase {
    Idle,
    Submitting,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Success,
    Error,
}

/// Side effects the page shell applies to the DOM.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEffect {
    FieldClass { field: String, class: FieldClass },
    /// Writes the field's error text into its ARIA live region.
    Announce { field: String, text: String },
    Focus { field: String },
    SubmitEnabled(bool),
    Busy(bool),
    ShowMessage {
        kind: MessageKind,
        text: String,
        dismiss_after: Duration,
    },
    DismissMessage,
    ResetForm,
}

/// Result of asking the session to start a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitDecision {
    /// Validation failed; no request may be issued.
    Blocked { first_invalid: String },
    /// A submission for this form is already in flight.
    AlreadySubmitting,
    /// The caller should send this payload to the form's endpoint.
    Proceed { endpoint: String, payload: Value },
}

/// Server acknowledgment of a successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitAck {
    pub message: Option<String>,
    pub body: Value,
}

/// Failure surfaced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub status: Option<u16>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }
}

/// Sends a validated form payload to its endpoint.
#[async_trait]
pub trait SubmitTransport: Send + Sync {
    async fn send(&self, endpoint: &str, payload: &Value) -> Result<SubmitAck, TransportError>;
}

/// What happened during a full [`FormSession::submit`] round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReport {
    pub status: SubmitStatus,
    pub effects: Vec<UiEffect>,
    pub event: Option<AppEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Blocked,
    Ignored,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
struct Field {
    spec: FieldSpec,
    value: String,
    state: FieldState,
    shown_error: String,
}

impl Field {
    fn is_validated(&self) -> bool {
        !self.spec.rules.is_empty()
    }

    fn reports_valid(&self) -> bool {
        match &self.state {
            FieldState::Valid => true,
            // Untouched fields count when their current value already passes,
            // so optional fields never hold the submit button hostage.
            FieldState::Untouched => run_all(&self.spec.rules, &self.value).valid,
            FieldState::Validating { .. } | FieldState::Invalid { .. } => false,
        }
    }
}

/// Validation and submission state for one form.
#[derive(Debug, Clone)]
pub struct FormSession {
    id: String,
    options: FormOptions,
    fields: Vec<Field>,
    phase: FormPhase,
    submit_enabled: bool,
    message_until: Option<Instant>,
    reset_at: Option<Instant>,
}

impl FormSession {
    pub fn new(id: impl Into<String>, fields: Vec<FieldSpec>, options: FormOptions) -> Self {
        let fields: Vec<Field> = fields
            .into_iter()
            .map(|spec| Field {
                spec,
                value: String::new(),
                state: FieldState::Untouched,
                shown_error: String::new(),
            })
            .collect();
        let mut session = Self {
            id: id.into(),
            options,
            fields,
            phase: FormPhase::Idle,
            submit_enabled: false,
            message_until: None,
            reset_at: None,
        };
        session.submit_enabled = session.compute_submit_enabled();
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> FormPhase {
        self.phase
    }

    pub fn is_submit_enabled(&self) -> bool {
        self.submit_enabled
    }

    pub fn field_state(&self, name: &str) -> Option<&FieldState> {
        self.field(name).map(|field| &field.state)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.field(name).map(|field| field.value.as_str())
    }

    /// Records new input and schedules a debounced revalidation.
    pub fn input(&mut self, name: &str, value: impl Into<String>, now: Instant) -> Vec<UiEffect> {
        let debounce = self.options.debounce;
        let Some(field) = self.field_mut(name) else {
            return Vec::new();
        };
        field.value = value.into();
        if !field.is_validated() {
            return Vec::new();
        }
        let was_validating = matches!(field.state, FieldState::Validating { .. });
        field.state = FieldState::Validating {
            due: now + debounce,
        };

        let mut effects = Vec::new();
        if !was_validating {
            effects.push(UiEffect::FieldClass {
                field: name.to_string(),
                class: FieldClass::Validating,
            });
        }
        self.sync_submit_enabled(&mut effects);
        effects
    }

    /// Blur skips the debounce window.
    pub fn blur(&mut self, name: &str) -> Vec<UiEffect> {
        let touched = self
            .field(name)
            .map(|field| field.is_validated() && field.state != FieldState::Untouched)
            .unwrap_or(false);
        if !touched {
            return Vec::new();
        }
        self.revalidate(name)
    }

    /// Runs the field's validators immediately, cancelling any pending debounce.
    pub fn revalidate(&mut self, name: &str) -> Vec<UiEffect> {
        let mut effects = Vec::new();
        self.revalidate_into(name, &mut effects);
        self.sync_submit_enabled(&mut effects);
        effects
    }

    /// Advances timers: due debounces, message dismissal and delayed reset.
    pub fn tick(&mut self, now: Instant) -> Vec<UiEffect> {
        let mut effects = Vec::new();

        let due: Vec<String> = self
            .fields
            .iter()
            .filter(|field| matches!(field.state, FieldState::Validating { due } if due <= now))
            .map(|field| field.spec.name.clone())
            .collect();
        for name in due {
            self.revalidate_into(&name, &mut effects);
        }

        if self.reset_at.is_some_and(|at| at <= now) {
            self.reset_at = None;
            self.reset_fields(&mut effects);
        }

        if self.message_until.is_some_and(|until| until <= now) {
            self.dismiss_into(&mut effects);
        }

        self.sync_submit_enabled(&mut effects);
        effects
    }

    /// Hides the transient message early, e.g. on `app:escape`.
    pub fn dismiss_message(&mut self) -> Vec<UiEffect> {
        let mut effects = Vec::new();
        if self.message_until.is_some() {
            self.dismiss_into(&mut effects);
        }
        effects
    }

    /// Authoritative pre-submit check: every field is revalidated regardless
    /// of debounce state before a request may be issued.
    pub fn begin_submit(&mut self) -> (SubmitDecision, Vec<UiEffect>) {
        if self.phase == FormPhase::Submitting {
            return (SubmitDecision::AlreadySubmitting, Vec::new());
        }

        let mut effects = Vec::new();
        let names: Vec<String> = self
            .fields
            .iter()
            .filter(|field| field.is_validated())
            .map(|field| field.spec.name.clone())
            .collect();
        for name in &names {
            self.revalidate_into(name, &mut effects);
        }

        let first_invalid = self
            .fields
            .iter()
            .find(|field| matches!(field.state, FieldState::Invalid { .. }))
            .map(|field| field.spec.name.clone());

        if let Some(first_invalid) = first_invalid {
            effects.push(UiEffect::Focus {
                field: first_invalid.clone(),
            });
            self.sync_submit_enabled(&mut effects);
            return (SubmitDecision::Blocked { first_invalid }, effects);
        }

        if self.message_until.is_some() {
            self.dismiss_into(&mut effects);
        }
        self.reset_at = None;
        self.phase = FormPhase::Submitting;
        effects.push(UiEffect::Busy(true));
        self.sync_submit_enabled(&mut effects);

        (
            SubmitDecision::Proceed {
                endpoint: self.options.endpoint.clone(),
                payload: self.payload(),
            },
            effects,
        )
    }

    /// Applies the transport result of an in-flight submission.
    pub fn finish_submit(
        &mut self,
        result: Result<SubmitAck, TransportError>,
        now: Instant,
    ) -> (Vec<UiEffect>, Option<AppEvent>) {
        if self.phase != FormPhase::Submitting {
            return (Vec::new(), None);
        }

        let mut effects = vec![UiEffect::Busy(false)];
        let ttl = self.options.message_ttl;
        self.message_until = Some(now + ttl);

        let event = match result {
            Ok(ack) => {
                self.phase = FormPhase::Success;
                effects.push(UiEffect::ShowMessage {
                    kind: MessageKind::Success,
                    text: ack
                        .message
                        .unwrap_or_else(|| DEFAULT_SUCCESS_MESSAGE.to_string()),
                    dismiss_after: ttl,
                });
                if self.options.reset_on_success {
                    self.reset_at = Some(now + self.options.reset_delay);
                }
                AppEvent::FormSuccess {
                    form_id: self.id.clone(),
                    payload: ack.body,
                }
            }
            Err(err) => {
                self.phase = FormPhase::Error;
                effects.push(UiEffect::ShowMessage {
                    kind: MessageKind::Error,
                    text: err.message.clone(),
                    dismiss_after: ttl,
                });
                AppEvent::FormError {
                    form_id: self.id.clone(),
                    message: err.message,
                }
            }
        };

        self.sync_submit_enabled(&mut effects);
        (effects, Some(event))
    }

    /// Full submission round-trip through `transport`.
    pub async fn submit<T, C>(&mut self, transport: &T, clock: C) -> SubmitReport
    where
        T: SubmitTransport + ?Sized,
        C: Fn() -> Instant,
    {
        let (decision, mut effects) = self.begin_submit();
        let (endpoint, payload) = match decision {
            SubmitDecision::Blocked { .. } => {
                return SubmitReport {
                    status: SubmitStatus::Blocked,
                    effects,
                    event: None,
                }
            }
            SubmitDecision::AlreadySubmitting => {
                return SubmitReport {
                    status: SubmitStatus::Ignored,
                    effects,
                    event: None,
                }
            }
            SubmitDecision::Proceed { endpoint, payload } => (endpoint, payload),
        };

        let result = transport.send(&endpoint, &payload).await;
        let status = if result.is_ok() {
            SubmitStatus::Succeeded
        } else {
            SubmitStatus::Failed
        };
        let (finished, event) = self.finish_submit(result, clock());
        effects.extend(finished);

        SubmitReport {
            status,
            effects,
            event,
        }
    }

    /// Current field values as a JSON object.
    pub fn payload(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|field| {
                (
                    field.spec.name.clone(),
                    Value::String(field.value.trim().to_string()),
                )
            })
            .collect();
        Value::Object(map)
    }

    fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.spec.name == name)
    }

    fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|field| field.spec.name == name)
    }

    fn revalidate_into(&mut self, name: &str, effects: &mut Vec<UiEffect>) {
        let Some(field) = self.field_mut(name) else {
            return;
        };
        if !field.is_validated() {
            return;
        }

        let previous = field.state.class();
        let verdict = run_all(&field.spec.rules, &field.value);
        let error_text = verdict.message.clone().unwrap_or_default();
        field.state = if verdict.valid {
            FieldState::Valid
        } else {
            FieldState::Invalid {
                message: error_text.clone(),
            }
        };

        let class = field.state.class();
        if class != previous {
            effects.push(UiEffect::FieldClass {
                field: name.to_string(),
                class,
            });
        }
        if field.shown_error != error_text {
            field.shown_error = error_text.clone();
            effects.push(UiEffect::Announce {
                field: name.to_string(),
                text: error_text,
            });
        }
    }

    fn reset_fields(&mut self, effects: &mut Vec<UiEffect>) {
        effects.push(UiEffect::ResetForm);
        for field in &mut self.fields {
            field.value.clear();
            let had_class = field.state != FieldState::Untouched;
            field.state = FieldState::Untouched;
            if had_class {
                effects.push(UiEffect::FieldClass {
                    field: field.spec.name.clone(),
                    class: FieldClass::Untouched,
                });
            }
            if !field.shown_error.is_empty() {
                field.shown_error.clear();
                effects.push(UiEffect::Announce {
                    field: field.spec.name.clone(),
                    text: String::new(),
                });
            }
        }
    }

    fn dismiss_into(&mut self, effects: &mut Vec<UiEffect>) {
        self.message_until = None;
        effects.push(UiEffect::DismissMessage);
        if matches!(self.phase, FormPhase::Success | FormPhase::Error) {
            self.phase = FormPhase::Idle;
        }
    }

    fn compute_submit_enabled(&self) -> bool {
        self.phase != FormPhase::Submitting
            && self
                .fields
                .iter()
                .filter(|field| field.is_validated())
                .all(Field::reports_valid)
    }

    fn sync_submit_enabled(&mut self, effects: &mut Vec<UiEffect>) {
        let enabled = self.compute_submit_enabled();
        if enabled != self.submit_enabled {
            self.submit_enabled = enabled;
            effects.push(UiEffect::SubmitEnabled(enabled));
        }
    }
}

/// Owns every form session discovered on the page.
#[derive(Debug, Default)]
pub struct FormManager {
    sessions: HashMap<String, FormSession>,
    order: Vec<String>,
}

impl FormManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session; a second form with the same id replaces the first.
    pub fn register(&mut self, session: FormSession) {
        let id = session.id().to_string();
        if self.sessions.insert(id.clone(), session).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Option<&FormSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FormSession> {
        self.sessions.get_mut(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ticks every session, returning effects keyed by form id.
    pub fn tick_all(&mut self, now: Instant) -> Vec<(String, Vec<UiEffect>)> {
        let mut out = Vec::new();
        for id in &self.order {
            if let Some(session) = self.sessions.get_mut(id) {
                let effects = session.tick(now);
                if !effects.is_empty() {
                    out.push((id.clone(), effects));
                }
            }
        }
        out
    }

    /// Dismisses every visible message.
    pub fn dismiss_all(&mut self) -> Vec<(String, Vec<UiEffect>)> {
        let mut out = Vec::new();
        for id in &self.order {
            if let Some(session) = self.sessions.get_mut(id) {
                let effects = session.dismiss_message();
                if !effects.is_empty() {
                    out.push((id.clone(), effects));
                }
            }
        }
        out
    }

    /// Drops all sessions when the page unloads.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.order.clear();
    }
}
