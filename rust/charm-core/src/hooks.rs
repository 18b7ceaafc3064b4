//! Dispatches host events to registered handlers.
//!
//! The host names every event after the hook it runs (`config-changed`,
//! `contrail-controller-relation-joined`, ...). Each role registers one handler per event it
//! cares about; everything else is logged and ignored, since hosts keep inventing new hooks.
use std::{collections::BTreeMap, fmt, str::FromStr};

use strum::{Display, EnumString, IntoStaticStr};

#[derive(
    Clone, Copy, Debug, Display, EnumString, Eq, Hash, IntoStaticStr, Ord, PartialEq, PartialOrd,
)]
#[strum(serialize_all = "kebab-case")]
pub enum RelationEvent {
    Created,
    Joined,
    Changed,
    Departed,
    Broken,
}

impl RelationEvent {
    /// The events that deliver new data from a remote unit
    pub const DATA: &'static [RelationEvent] = &[RelationEvent::Joined, RelationEvent::Changed];

    /// The events that take a remote unit away
    pub const GONE: &'static [RelationEvent] = &[RelationEvent::Departed, RelationEvent::Broken];
}

/// A parsed hook name
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Hook {
    Lifecycle(String),
    Relation {
        endpoint: String,
        event: RelationEvent,
    },
}

impl Hook {
    pub fn parse(name: &str) -> Hook {
        if let Some((endpoint, event)) = name.rsplit_once("-relation-") {
            if let (false, Ok(event)) = (endpoint.is_empty(), RelationEvent::from_str(event)) {
                return Hook::Relation {
                    endpoint: endpoint.to_string(),
                    event,
                };
            }
        }
        Hook::Lifecycle(name.to_string())
    }

    pub fn relation(endpoint: &str, event: RelationEvent) -> Hook {
        Hook::Relation {
            endpoint: endpoint.to_string(),
            event,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Hook::Relation { endpoint, .. } => Some(endpoint),
            Hook::Lifecycle(_) => None,
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Lifecycle(name) => f.write_str(name),
            Hook::Relation { endpoint, event } => write!(f, "{endpoint}-relation-{event}"),
        }
    }
}

pub const INSTALL: &str = "install";
pub const CONFIG_CHANGED: &str = "config-changed";
pub const UPGRADE_CHARM: &str = "upgrade-charm";
pub const UPDATE_STATUS: &str = "update-status";
pub const LEADER_ELECTED: &str = "leader-elected";
pub const LEADER_SETTINGS_CHANGED: &str = "leader-settings-changed";
pub const STOP: &str = "stop";

pub type Handler<C, E> = fn(&mut C) -> Result<(), E>;

/// Table of hook name to handler
pub struct Hooks<C, E> {
    handlers: BTreeMap<String, Handler<C, E>>,
}

impl<C, E> Default for Hooks<C, E> {
    fn default() -> Self {
        Hooks {
            handlers: BTreeMap::new(),
        }
    }
}

impl<C, E> Hooks<C, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, hooks: &[&str], handler: Handler<C, E>) -> Self {
        for hook in hooks {
            self.handlers.insert(hook.to_string(), handler);
        }
        self
    }

    pub fn on_relation(
        mut self,
        endpoint: &str,
        events: &[RelationEvent],
        handler: Handler<C, E>,
    ) -> Self {
        for event in events {
            self.handlers
                .insert(Hook::relation(endpoint, *event).to_string(), handler);
        }
        self
    }

    pub fn is_registered(&self, hook: &str) -> bool {
        self.handlers.contains_key(hook)
    }

    /// Runs the handler registered for `hook`, returning whether there was one
    pub fn execute(&self, hook: &str, context: &mut C) -> Result<bool, E> {
        match self.handlers.get(hook) {
            Some(handler) => {
                tracing::info!(hook, "running hook");
                handler(context)?;
                Ok(true)
            }
            None => {
                tracing::info!(hook, "no handler registered, ignoring hook");
                Ok(false)
            }
        }
    }
}
