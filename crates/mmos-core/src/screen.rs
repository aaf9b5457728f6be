//! Navigation stack state machine.
//!
//! # Architecture: Event-Returning State Machine
//!
//! Every transition takes the kernel services it needs as a parameter and
//! returns the [`LifecycleEvent`]s it produced, in order. The manager never
//! stores references to the kernel, so it can be driven by the kernel tick,
//! by tests, or by a simulation harness alike.
//!
//! # State Machine
//!
//! ```text
//!            launch                      show_overlay
//! ┌──────┐ ─────────> ┌────────┐ ─────────────────────> ┌───────────┐
//! │ Idle │            │ Active │                         │ Suspended │
//! └──────┘ <───────── └────────┘ <───────────────────── └───────────┘
//!        go_back (last)    │  ▲     dismiss_overlay
//!                          └──┘
//!              launch / go_back / replace_top
//! ```
//!
//! # Invariants
//!
//! - `Idle` if and only if the stack is empty
//! - In `Active`, the top frame is the only `Active` frame
//! - In `Suspended`, no frame is `Active`
//! - A failed transition leaves the stack exactly as it was

use mmos_proto::ProtocolTag;

use crate::{
    app::{App, InstanceId},
    context::{AppContext, Services},
    error::LifecycleError,
};

/// Manager-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Stack is empty
    Idle,
    /// Top frame has focus
    Active,
    /// Frames exist but an overlay holds focus
    Suspended,
}

/// Focus state of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Receives `on_tick`
    Active,
    /// Receives no callbacks until re-exposed
    Suspended,
}

/// What a transition did to one instance.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Instance created and focused
    Started {
        /// New instance
        instance: InstanceId,
        /// Its app
        app_id: String,
    },
    /// Instance lost focus
    Suspended {
        /// Affected instance
        instance: InstanceId,
    },
    /// Instance regained focus
    Resumed {
        /// Affected instance
        instance: InstanceId,
    },
    /// Instance dismissed and its endpoints closed
    Stopped {
        /// Dismissed instance
        instance: InstanceId,
        /// Its app
        app_id: String,
        /// State it asked to persist
        saved_state: Option<serde_json::Value>,
    },
}

/// Presentation data the shell draws for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationState {
    /// Title bar text
    pub title: String,
}

/// One entry of the navigation stack.
pub struct ScreenFrame {
    instance: InstanceId,
    app_id: String,
    app: Box<dyn App>,
    state: FrameState,
    presentation: PresentationState,
}

impl ScreenFrame {
    /// Instance id.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// App the frame runs.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Focus state.
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Presentation data.
    pub fn presentation(&self) -> &PresentationState {
        &self.presentation
    }

    /// State the app would persist right now.
    pub fn save_state(&self) -> Option<serde_json::Value> {
        self.app.save_state()
    }
}

impl std::fmt::Debug for ScreenFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenFrame")
            .field("instance", &self.instance)
            .field("app_id", &self.app_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Owner of the navigation stack.
#[derive(Debug)]
pub struct ScreenLifecycleManager {
    stack: Vec<ScreenFrame>,
    state: ManagerState,
    next_instance: u64,
}

impl Default for ScreenLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenLifecycleManager {
    /// Empty manager in `Idle`.
    pub fn new() -> Self {
        Self { stack: Vec::new(), state: ManagerState::Idle, next_instance: 1 }
    }

    /// Manager state.
    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Frames, bottom first.
    pub fn frames(&self) -> &[ScreenFrame] {
        &self.stack
    }

    /// Top frame.
    pub fn top(&self) -> Option<&ScreenFrame> {
        self.stack.last()
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// `(app_id, state)` per frame, bottom first.
    pub fn snapshot(&self) -> Vec<(String, FrameState)> {
        self.stack.iter().map(|f| (f.app_id.clone(), f.state)).collect()
    }

    /// Push a new instance of `app_id` on top.
    ///
    /// # Errors
    /// - `App(Unknown)` if the app is not installed; nothing changes
    /// - `OverlayActive` while an overlay holds focus
    pub fn launch(
        &mut self,
        app_id: &str,
        services: &mut Services<'_>,
        restore: Option<&serde_json::Value>,
    ) -> Result<Vec<LifecycleEvent>, LifecycleError> {
        self.ensure_no_overlay()?;
        let app = services.apps.instantiate(app_id)?;

        let mut events = Vec::new();
        if let Some(top) = self.stack.last_mut() {
            suspend(top, services, &mut events);
        }
        self.push(app_id, app, services, restore, &mut events);

        Ok(events)
    }

    /// Dismiss the top frame and re-expose the one beneath.
    ///
    /// Leaves the manager `Idle` when the last frame goes; what happens
    /// next is the caller's policy.
    ///
    /// # Errors
    /// - `EmptyStack` if there is nothing to dismiss
    /// - `OverlayActive` while an overlay holds focus
    pub fn go_back(
        &mut self,
        services: &mut Services<'_>,
    ) -> Result<Vec<LifecycleEvent>, LifecycleError> {
        self.ensure_no_overlay()?;
        let frame = self.stack.pop().ok_or(LifecycleError::EmptyStack)?;

        let mut events = Vec::new();
        dismiss(frame, services, &mut events);

        match self.stack.last_mut() {
            Some(top) => {
                resume(top, services, &mut events);
                self.state = ManagerState::Active;
            },
            None => self.state = ManagerState::Idle,
        }

        Ok(events)
    }

    /// Atomically swap the top frame for a new instance of `app_id`.
    ///
    /// The frame beneath is never resumed, not even transiently. On an empty
    /// stack this is a plain launch.
    ///
    /// # Errors
    /// - `App(Unknown)` if the app is not installed; nothing changes
    /// - `OverlayActive` while an overlay holds focus
    pub fn replace_top(
        &mut self,
        app_id: &str,
        services: &mut Services<'_>,
        restore: Option<&serde_json::Value>,
    ) -> Result<Vec<LifecycleEvent>, LifecycleError> {
        self.ensure_no_overlay()?;
        let app = services.apps.instantiate(app_id)?;

        let mut events = Vec::new();
        if let Some(old) = self.stack.pop() {
            dismiss(old, services, &mut events);
        }
        self.push(app_id, app, services, restore, &mut events);

        Ok(events)
    }

    /// Take focus away from the top frame for a system overlay.
    ///
    /// # Errors
    /// - `EmptyStack` if there is no frame to cover
    /// - `OverlayActive` if an overlay is already showing
    pub fn show_overlay(
        &mut self,
        services: &mut Services<'_>,
    ) -> Result<Vec<LifecycleEvent>, LifecycleError> {
        self.ensure_no_overlay()?;
        let top = self.stack.last_mut().ok_or(LifecycleError::EmptyStack)?;

        let mut events = Vec::new();
        suspend(top, services, &mut events);
        self.state = ManagerState::Suspended;
        Ok(events)
    }

    /// Give focus back to the top frame.
    ///
    /// # Errors
    /// Returns `NoOverlay` if no overlay is showing.
    pub fn dismiss_overlay(
        &mut self,
        services: &mut Services<'_>,
    ) -> Result<Vec<LifecycleEvent>, LifecycleError> {
        if self.state != ManagerState::Suspended {
            return Err(LifecycleError::NoOverlay);
        }
        let top = self.stack.last_mut().ok_or(LifecycleError::EmptyStack)?;

        let mut events = Vec::new();
        resume(top, services, &mut events);
        self.state = ManagerState::Active;
        Ok(events)
    }

    /// Dismiss every frame, top to bottom, without resuming any.
    pub fn dismiss_all(&mut self, services: &mut Services<'_>) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        while let Some(frame) = self.stack.pop() {
            dismiss(frame, services, &mut events);
        }
        self.state = ManagerState::Idle;
        events
    }

    /// Run `on_tick` on the focused frame. Returns whether one ran.
    pub fn tick_active(
        &mut self,
        elapsed: std::time::Duration,
        services: &mut Services<'_>,
    ) -> bool {
        if self.state != ManagerState::Active {
            return false;
        }
        let Some(top) = self.stack.last_mut() else {
            return false;
        };

        let mut ctx = AppContext::new(top.instance, &top.app_id, services);
        top.app.on_tick(&mut ctx, elapsed);
        true
    }

    /// Check the structural invariants.
    ///
    /// # Errors
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let active: Vec<usize> = self
            .stack
            .iter()
            .enumerate()
            .filter(|(_, f)| f.state == FrameState::Active)
            .map(|(i, _)| i)
            .collect();

        match self.state {
            ManagerState::Idle if !self.stack.is_empty() => {
                Err(format!("Idle with {} frames", self.stack.len()))
            },
            ManagerState::Active | ManagerState::Suspended if self.stack.is_empty() => {
                Err(format!("{:?} with an empty stack", self.state))
            },
            ManagerState::Active if active != [self.stack.len() - 1] => {
                Err(format!("Active but active frames are {active:?}"))
            },
            ManagerState::Suspended if !active.is_empty() => {
                Err(format!("Suspended but active frames are {active:?}"))
            },
            _ => Ok(()),
        }
    }

    /// Tags bound by the frame at `index` (bottom is 0).
    pub fn endpoints_of(&self, index: usize, services: &Services<'_>) -> Vec<ProtocolTag> {
        self.stack.get(index).map(|f| services.net.endpoints_of(f.instance)).unwrap_or_default()
    }

    fn ensure_no_overlay(&self) -> Result<(), LifecycleError> {
        if self.state == ManagerState::Suspended {
            return Err(LifecycleError::OverlayActive);
        }
        Ok(())
    }

    fn push(
        &mut self,
        app_id: &str,
        mut app: Box<dyn App>,
        services: &mut Services<'_>,
        restore: Option<&serde_json::Value>,
        events: &mut Vec<LifecycleEvent>,
    ) {
        let instance = InstanceId(self.next_instance);
        self.next_instance += 1;

        if let Some(state) = restore {
            app.restore_state(state);
        }

        let title = services
            .apps
            .manifest(app_id)
            .map_or_else(|| app_id.to_string(), |m| m.name.clone());
        let mut frame = ScreenFrame {
            instance,
            app_id: app_id.to_string(),
            app,
            state: FrameState::Active,
            presentation: PresentationState { title },
        };

        let mut ctx = AppContext::new(instance, &frame.app_id, services);
        frame.app.on_start(&mut ctx);
        tracing::debug!(app = app_id, %instance, "frame started");

        self.stack.push(frame);
        self.state = ManagerState::Active;
        events.push(LifecycleEvent::Started { instance, app_id: app_id.to_string() });
    }
}

fn suspend(frame: &mut ScreenFrame, services: &mut Services<'_>, events: &mut Vec<LifecycleEvent>) {
    if frame.state == FrameState::Suspended {
        return;
    }
    let mut ctx = AppContext::new(frame.instance, &frame.app_id, services);
    frame.app.on_suspend(&mut ctx);
    frame.state = FrameState::Suspended;
    events.push(LifecycleEvent::Suspended { instance: frame.instance });
}

fn resume(frame: &mut ScreenFrame, services: &mut Services<'_>, events: &mut Vec<LifecycleEvent>) {
    if frame.state == FrameState::Active {
        return;
    }
    let mut ctx = AppContext::new(frame.instance, &frame.app_id, services);
    frame.app.on_resume(&mut ctx);
    frame.state = FrameState::Active;
    events.push(LifecycleEvent::Resumed { instance: frame.instance });
}

fn dismiss(mut frame: ScreenFrame, services: &mut Services<'_>, events: &mut Vec<LifecycleEvent>) {
    {
        let mut ctx = AppContext::new(frame.instance, &frame.app_id, services);
        frame.app.on_stop(&mut ctx);
    }
    let saved_state = frame.app.save_state();
    let closed = services.net.close_owned_by(frame.instance);
    tracing::debug!(app = %frame.app_id, instance = %frame.instance, closed, "frame dismissed");

    events.push(LifecycleEvent::Stopped {
        instance: frame.instance,
        app_id: frame.app_id,
        saved_state,
    });
}
