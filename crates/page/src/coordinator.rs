//! Page-level wiring: owns the form sessions, the offline worker handle and
//! the event bus, and forwards browser events to whichever modules came up.

use std::{error::Error as StdError, sync::Arc, time::Instant};

use landing_core::events::{AppEvent, EventBus, SwipeDirection};
use landing_core::form::{
    FieldSpec, FormManager, FormOptions, FormSession, SubmitReport, SubmitTransport, UiEffect,
};
use landing_offline::{
    Dispatcher, SyncReport, WorkerError, WorkerHandle, SYNC_ANALYTICS_TAG, SYNC_FORMS_TAG,
};
use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::reporter::{ErrorOrigin, ErrorReporter};
use crate::transport::HttpSubmitTransport;

/// Minimum travel in pixels before a touch gesture counts as a swipe.
pub const SWIPE_THRESHOLD: f64 = 50.0;

/// A form discovered on the page.
#[derive(Debug, Clone)]
pub struct FormDecl {
    pub id: String,
    pub fields: Vec<FieldSpec>,
    pub options: FormOptions,
}

impl FormDecl {
    pub fn new(id: impl Into<String>, fields: Vec<FieldSpec>, options: FormOptions) -> Self {
        Self {
            id: id.into(),
            fields,
            options,
        }
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("form is missing an id")]
    MissingFormId,
    #[error("form `{0}` declares no fields")]
    EmptyForm(String),
    #[error("form `{form}` has an invalid endpoint `{endpoint}`")]
    InvalidEndpoint { form: String, endpoint: String },
}

/// Typed handles to every page module. Modules that failed to start are
/// `None` and every forwarding method tolerates their absence.
pub struct Coordinator {
    origin: Url,
    bus: EventBus,
    reporter: ErrorReporter,
    forms: Option<FormManager>,
    worker: Option<WorkerHandle>,
    worker_task: Option<JoinHandle<()>>,
    offline_registered: bool,
    transport: Option<Arc<dyn SubmitTransport>>,
    viewport: Option<(u32, u32)>,
    visible: bool,
}

impl Coordinator {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            bus: EventBus::new(),
            reporter: ErrorReporter::new(),
            forms: None,
            worker: None,
            worker_task: None,
            offline_registered: false,
            transport: None,
            viewport: None,
            visible: true,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    pub fn forms(&self) -> Option<&FormManager> {
        self.forms.as_ref()
    }

    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    /// Builds a session per declared form. A form that fails to initialize is
    /// reported and skipped; the module stays absent when none succeed.
    pub fn init_forms(&mut self, decls: Vec<FormDecl>) -> usize {
        let mut manager = FormManager::new();
        for decl in decls {
            let id = decl.id.clone();
            let session = self.build_session(decl);
            if let Some(session) = self.reporter.capture(ErrorOrigin::ModuleInit, &id, session) {
                manager.register(session);
            }
        }

        let count = manager.len();
        if count == 0 {
            warn!(stage = "app", "no forms initialized, form module disabled");
            self.forms = None;
        } else {
            info!(stage = "app", forms = count, "form module ready");
            self.forms = Some(manager);
        }
        count
    }

    fn build_session(&self, decl: FormDecl) -> Result<FormSession, InitError> {
        if decl.id.trim().is_empty() {
            return Err(InitError::MissingFormId);
        }
        if decl.fields.is_empty() {
            return Err(InitError::EmptyForm(decl.id));
        }
        if self.origin.join(&decl.options.endpoint).is_err() {
            return Err(InitError::InvalidEndpoint {
                endpoint: decl.options.endpoint.clone(),
                form: decl.id,
            });
        }
        Ok(FormSession::new(decl.id, decl.fields, decl.options))
    }

    /// Starts the offline worker. Only the first successful registration per
    /// page lifetime takes effect; later calls return `false` untouched.
    pub fn register_offline<E, F>(&mut self, init: F) -> bool
    where
        E: StdError,
        F: FnOnce() -> Result<Dispatcher, E>,
    {
        if self.offline_registered {
            debug!(stage = "app", "offline worker already registered");
            return false;
        }
        let Some(dispatcher) = self
            .reporter
            .capture(ErrorOrigin::ModuleInit, "offline", init())
        else {
            warn!(stage = "app", "offline module disabled");
            return false;
        };

        let (handle, task) = landing_offline::spawn(dispatcher);
        self.worker = Some(handle);
        self.worker_task = Some(task);
        self.offline_registered = true;
        info!(stage = "app", "offline worker registered");
        true
    }

    /// Returns whether the offline worker is still running. A worker that
    /// panicked or exited is reported once and dropped, after which the page
    /// behaves as if it never started.
    pub async fn supervise_worker(&mut self) -> bool {
        let finished = self
            .worker_task
            .as_ref()
            .is_some_and(JoinHandle::is_finished);
        let task = match self.worker_task.take() {
            Some(task) if finished => task,
            other => {
                self.worker_task = other;
                return self.worker.is_some();
            }
        };

        self.worker = None;
        match task.await {
            Err(err) => self.reporter.report(ErrorOrigin::Rejection, "offline", &err),
            Ok(()) => self
                .reporter
                .report(ErrorOrigin::Rejection, "offline", &WorkerError::Stopped),
        }
        warn!(stage = "app", "offline worker lost, module disabled");
        false
    }

    /// Funnels a failure from a page event handler into the reporter.
    pub fn report_unhandled(&self, context: &str, err: &dyn StdError) {
        self.reporter.report(ErrorOrigin::Handler, context, err);
    }

    pub fn set_transport(&mut self, transport: Arc<dyn SubmitTransport>) {
        self.transport = Some(transport);
    }

    /// Installs the HTTP transport, wired to the offline outbox when the
    /// worker is up.
    pub fn use_http_transport(&mut self, http: Client) {
        let mut transport = HttpSubmitTransport::new(self.origin.clone(), http);
        if let Some(worker) = &self.worker {
            transport = transport.with_outbox(worker.clone());
        }
        self.transport = Some(Arc::new(transport));
    }

    pub fn input(&mut self, form: &str, field: &str, value: &str, now: Instant) -> Vec<UiEffect> {
        self.session_mut(form)
            .map(|session| session.input(field, value, now))
            .unwrap_or_default()
    }

    pub fn blur(&mut self, form: &str, field: &str) -> Vec<UiEffect> {
        self.session_mut(form)
            .map(|session| session.blur(field))
            .unwrap_or_default()
    }

    /// Advances debounce and message timers on every form.
    pub fn tick(&mut self, now: Instant) -> Vec<(String, Vec<UiEffect>)> {
        self.forms
            .as_mut()
            .map(|forms| forms.tick_all(now))
            .unwrap_or_default()
    }

    /// Submits one form and broadcasts its outcome on the bus. Returns `None`
    /// when the form or the transport is unavailable.
    pub async fn submit<C>(&mut self, form: &str, clock: C) -> Option<SubmitReport>
    where
        C: Fn() -> Instant,
    {
        let Some(transport) = self.transport.clone() else {
            warn!(stage = "app", form, "submit without a transport");
            return None;
        };
        let session = self.session_mut(form)?;
        let report = session.submit(transport.as_ref(), clock).await;
        if let Some(event) = &report.event {
            self.bus.publish(event);
        }
        Some(report)
    }

    pub fn on_resize(&mut self, width: u32, height: u32) -> usize {
        if self.viewport == Some((width, height)) {
            return 0;
        }
        self.viewport = Some((width, height));
        self.bus.publish(&AppEvent::Resize { width, height })
    }

    /// Escape closes every transient message before notifying subscribers.
    pub fn on_escape(&mut self) -> Vec<(String, Vec<UiEffect>)> {
        let effects = self
            .forms
            .as_mut()
            .map(FormManager::dismiss_all)
            .unwrap_or_default();
        self.bus.publish(&AppEvent::Escape);
        effects
    }

    /// Classifies a touch gesture and publishes it when it is a swipe.
    pub fn on_touch(&mut self, start: (f64, f64), end: (f64, f64)) -> Option<SwipeDirection> {
        let direction = swipe_direction(start, end)?;
        self.bus.publish(&AppEvent::Swipe { direction });
        Some(direction)
    }

    pub fn on_scroll_intersect(&mut self, target: &str, ratio: f64) -> usize {
        self.bus.publish(&AppEvent::ScrollIntersect {
            target: target.to_string(),
            ratio,
        })
    }

    pub fn record_metric(&mut self, name: &str, value: f64) -> usize {
        self.bus.publish(&AppEvent::PerformanceMetric {
            name: name.to_string(),
            value,
        })
    }

    /// Becoming visible again is the connectivity hint that flushes both
    /// offline queues.
    pub async fn on_visibility_change(&mut self, visible: bool) -> Vec<SyncReport> {
        let was_visible = std::mem::replace(&mut self.visible, visible);
        if !visible || was_visible || !self.supervise_worker().await {
            return Vec::new();
        }
        let Some(worker) = self.worker.clone() else {
            return Vec::new();
        };

        let mut reports = Vec::new();
        for tag in [SYNC_FORMS_TAG, SYNC_ANALYTICS_TAG] {
            if let Some(report) =
                self.reporter
                    .capture(ErrorOrigin::Rejection, tag, worker.sync(tag).await)
            {
                reports.push(report);
            }
        }
        reports
    }

    /// Drops every form session when the page unloads.
    pub fn unload(&mut self) {
        if let Some(forms) = self.forms.as_mut() {
            forms.clear();
        }
        self.forms = None;
    }

    fn session_mut(&mut self, form: &str) -> Option<&mut FormSession> {
        self.forms.as_mut()?.get_mut(form)
    }
}

/// Dominant-axis swipe direction, or `None` below [`SWIPE_THRESHOLD`].
pub fn swipe_direction(start: (f64, f64), end: (f64, f64)) -> Option<SwipeDirection> {
    let dx = end.0 - start.0;
    let dy = end.1 - start.1;
    if dx.abs().max(dy.abs()) < SWIPE_THRESHOLD {
        return None;
    }
    Some(if dx.abs() >= dy.abs() {
        if dx > 0.0 {
            SwipeDirection::Right
        } else {
            SwipeDirection::Left
        }
    } else if dy > 0.0 {
        SwipeDirection::Down
    } else {
        SwipeDirection::Up
    })
}
