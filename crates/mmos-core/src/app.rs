//! Apps and the install catalog.
//!
//! Every app is a value behind one capability trait, [`App`]. The catalog
//! ([`AppRegistry`]) maps an app id to its manifest and a factory; each
//! activation gets a brand-new instance from the factory, so two instances
//! of the same app never share state or endpoints.

use std::{collections::HashMap, fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{context::AppContext, error::AppError};

/// Identity of one app instance (one navigation frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle callbacks of an app instance.
///
/// Every callback receives an [`AppContext`] scoped to the instance. All
/// callbacks default to no-ops so that apps only implement what they use.
///
/// Callbacks run inside the kernel tick and must not block.
pub trait App: Send {
    /// Instance was pushed onto the navigation stack and has focus.
    fn on_start(&mut self, _ctx: &mut AppContext<'_>) {}

    /// Instance regained focus after the frame above it was dismissed.
    fn on_resume(&mut self, _ctx: &mut AppContext<'_>) {}

    /// Instance lost focus to a new frame or an overlay.
    fn on_suspend(&mut self, _ctx: &mut AppContext<'_>) {}

    /// One kernel tick while the instance has focus.
    fn on_tick(&mut self, _ctx: &mut AppContext<'_>, _elapsed: Duration) {}

    /// Instance is being dismissed. Its endpoints are closed right after.
    fn on_stop(&mut self, _ctx: &mut AppContext<'_>) {}

    /// State to persist across dismissals and restarts.
    fn save_state(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore state saved by a previous instance. Called before `on_start`.
    fn restore_state(&mut self, _state: &serde_json::Value) {}
}

/// Creates fresh instances of one app.
pub type AppFactory = Box<dyn Fn() -> Box<dyn App> + Send + Sync>;

/// Display metadata and capability requirements of an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppManifest {
    /// Unique id (`"calculator"`)
    pub id: String,
    /// Display name (`"Calculator"`)
    pub name: String,
    /// One-line description
    pub description: String,
    /// Needs the embedded browser capability
    pub requires_browser: bool,
    /// Needs a connected relay to be useful
    pub requires_network: bool,
}

impl AppManifest {
    /// Manifest with the given id and display name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            requires_browser: false,
            requires_network: false,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark as needing the browser capability.
    #[must_use]
    pub fn requiring_browser(mut self) -> Self {
        self.requires_browser = true;
        self
    }

    /// Mark as needing the network.
    #[must_use]
    pub fn requiring_network(mut self) -> Self {
        self.requires_network = true;
        self
    }
}

struct Installed {
    manifest: AppManifest,
    factory: AppFactory,
}

/// Catalog of installed apps.
#[derive(Default)]
pub struct AppRegistry {
    apps: HashMap<String, Installed>,
    order: Vec<String>,
}

impl AppRegistry {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an app.
    ///
    /// # Errors
    /// Returns `Duplicate` if an app with the same id is installed.
    pub fn install(&mut self, manifest: AppManifest, factory: AppFactory) -> Result<(), AppError> {
        if self.apps.contains_key(&manifest.id) {
            return Err(AppError::Duplicate(manifest.id));
        }
        tracing::debug!(app = %manifest.id, "app installed");
        self.order.push(manifest.id.clone());
        self.apps.insert(manifest.id.clone(), Installed { manifest, factory });
        Ok(())
    }

    /// Remove an app. Running instances are unaffected.
    ///
    /// # Errors
    /// Returns `Unknown` if no app with this id is installed.
    pub fn uninstall(&mut self, app_id: &str) -> Result<AppManifest, AppError> {
        let installed = self.apps.remove(app_id).ok_or_else(|| AppError::Unknown(app_id.into()))?;
        self.order.retain(|id| id != app_id);
        Ok(installed.manifest)
    }

    /// Create a fresh instance.
    ///
    /// # Errors
    /// Returns `Unknown` if no app with this id is installed.
    pub fn instantiate(&self, app_id: &str) -> Result<Box<dyn App>, AppError> {
        let installed = self.apps.get(app_id).ok_or_else(|| AppError::Unknown(app_id.into()))?;
        Ok((installed.factory)())
    }

    /// Whether `app_id` is installed.
    pub fn contains(&self, app_id: &str) -> bool {
        self.apps.contains_key(app_id)
    }

    /// Manifest of an installed app.
    pub fn manifest(&self, app_id: &str) -> Option<&AppManifest> {
        self.apps.get(app_id).map(|installed| &installed.manifest)
    }

    /// Manifests in launcher order.
    pub fn manifests(&self) -> impl Iterator<Item = &AppManifest> {
        self.order.iter().filter_map(|id| self.manifest(id))
    }

    /// Manifests whose requirements are met, in launcher order.
    pub fn runnable(&self, browser: bool, online: bool) -> Vec<&AppManifest> {
        self.manifests()
            .filter(|m| (browser || !m.requires_browser) && (online || !m.requires_network))
            .collect()
    }

    /// App ids in launcher order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Move the listed ids to the front, in the given order.
    ///
    /// Unknown ids are ignored; unlisted apps keep their relative order.
    pub fn apply_order(&mut self, preferred: &[String]) {
        let mut order: Vec<String> = Vec::with_capacity(self.order.len());
        for id in preferred {
            if self.apps.contains_key(id) && !order.contains(id) {
                order.push(id.clone());
            }
        }
        for id in &self.order {
            if !order.contains(id) {
                order.push(id.clone());
            }
        }
        self.order = order;
    }

    /// Number of installed apps.
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    /// Whether nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRegistry").field("order", &self.order).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    struct Counter {
        ticks: u32,
    }

    impl App for Counter {
        fn on_tick(&mut self, _ctx: &mut AppContext<'_>, _elapsed: Duration) {
            self.ticks += 1;
        }

        fn save_state(&self) -> Option<serde_json::Value> {
            Some(serde_json::json!(self.ticks))
        }
    }

    fn counter_factory(created: Arc<AtomicUsize>) -> AppFactory {
        Box::new(move || {
            created.fetch_add(1, Ordering::SeqCst);
            Box::new(Counter { ticks: 0 })
        })
    }

    #[test]
    fn duplicate_install_is_rejected() {
        let mut apps = AppRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        apps.install(AppManifest::new("counter", "Counter"), counter_factory(created.clone()))
            .unwrap();

        let err = apps
            .install(AppManifest::new("counter", "Counter 2"), counter_factory(created))
            .unwrap_err();
        assert_eq!(err, AppError::Duplicate("counter".into()));
        assert_eq!(apps.manifest("counter").unwrap().name, "Counter");
    }

    #[test]
    fn instantiate_unknown_app() {
        let apps = AppRegistry::new();
        assert!(matches!(apps.instantiate("nope"), Err(AppError::Unknown(id)) if id == "nope"));
    }

    #[test]
    fn every_instantiation_is_fresh() {
        let mut apps = AppRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        apps.install(AppManifest::new("counter", "Counter"), counter_factory(created.clone()))
            .unwrap();

        let first = apps.instantiate("counter").unwrap();
        let second = apps.instantiate("counter").unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(first.save_state(), second.save_state());
    }

    #[test]
    fn order_follows_install_then_preference() {
        let mut apps = AppRegistry::new();
        for id in ["a", "b", "c", "d"] {
            apps.install(AppManifest::new(id, id), Box::new(|| Box::new(Counter { ticks: 0 })))
                .unwrap();
        }
        assert_eq!(apps.order(), ["a", "b", "c", "d"]);

        apps.apply_order(&["c".into(), "ghost".into(), "a".into()]);
        assert_eq!(apps.order(), ["c", "a", "b", "d"]);

        apps.uninstall("a").unwrap();
        let ids: Vec<_> = apps.manifests().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "d"]);
    }
}
