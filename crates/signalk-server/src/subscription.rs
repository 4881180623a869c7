//! Per-client subscriptions.
//!
//! A client holds a list of (context pattern, path pattern) pairs. A delta
//! is delivered whole when any pair matches its context and at least one of
//! its value paths.

use signalk_core::{Delta, PathPattern, PatternError};
use signalk_protocol::{SubscribeMode, Subscription};

/// Context clients use to refer to the own vessel.
pub const SELF_ALIAS: &str = "vessels.self";

#[derive(Debug, Clone)]
pub struct ClientSubscription {
    context: PathPattern,
    path: PathPattern,
}

impl ClientSubscription {
    pub fn new(context: &str, path: &str) -> Result<Self, PatternError> {
        Ok(Self {
            context: PathPattern::new(context)?,
            path: PathPattern::new(path)?,
        })
    }

    pub fn context(&self) -> &str {
        self.context.as_str()
    }

    pub fn path(&self) -> &str {
        self.path.as_str()
    }

    pub fn matches(&self, context: &str, path: &str) -> bool {
        self.context.matches(context) && self.path.matches(path)
    }
}

/// Subscriptions of one WebSocket client.
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    self_context: String,
    subscriptions: Vec<ClientSubscription>,
}

impl SubscriptionManager {
    pub fn new(self_context: &str) -> Self {
        Self {
            self_context: self_context.to_string(),
            subscriptions: Vec::new(),
        }
    }

    /// Manager preloaded for the `?subscribe=` query value.
    pub fn with_mode(self_context: &str, mode: SubscribeMode) -> Self {
        let mut manager = Self::new(self_context);
        match mode {
            SubscribeMode::None => {}
            SubscribeMode::All => manager.subscribe_all(),
            SubscribeMode::SelfOnly => manager.subscribe_self_all(),
        }
        manager
    }

    /// Map `vessels.self` and `self` onto the configured own context.
    fn resolve<'a>(&'a self, context: &'a str) -> &'a str {
        if context == SELF_ALIAS || context == "self" {
            &self.self_context
        } else {
            context
        }
    }

    pub fn subscribe_self_all(&mut self) {
        self.push(ClientSubscription {
            context: PathPattern::new(&self.self_context).unwrap_or_else(|_| PathPattern::any()),
            path: PathPattern::any(),
        });
    }

    pub fn subscribe_all(&mut self) {
        self.subscriptions.clear();
        self.push(ClientSubscription {
            context: PathPattern::any(),
            path: PathPattern::any(),
        });
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    fn push(&mut self, sub: ClientSubscription) {
        let duplicate = self
            .subscriptions
            .iter()
            .any(|s| s.context == sub.context && s.path == sub.path);
        if !duplicate {
            self.subscriptions.push(sub);
        }
    }

    /// Add one subscription per entry. Entries with an invalid pattern are
    /// skipped and their errors returned.
    pub fn add(&mut self, context: &str, subscribe: &[Subscription]) -> Vec<PatternError> {
        let context = self.resolve(context).to_string();
        let mut errors = Vec::new();
        for entry in subscribe {
            match ClientSubscription::new(&context, &entry.path) {
                Ok(sub) => self.push(sub),
                Err(e) => errors.push(e),
            }
        }
        errors
    }

    /// Remove the exact (context, path) pair. A `*` path clears every
    /// subscription under the context, and `*` for both clears everything.
    /// Returns how many subscriptions were removed.
    pub fn remove(&mut self, context: &str, path: &str) -> usize {
        let context = self.resolve(context).to_string();
        let before = self.subscriptions.len();
        match (context.as_str(), path) {
            ("*", "*") => self.subscriptions.clear(),
            (ctx, "*") => self.subscriptions.retain(|s| s.context() != ctx),
            (ctx, path) => self
                .subscriptions
                .retain(|s| !(s.context() == ctx && s.path() == path)),
        }
        before - self.subscriptions.len()
    }

    pub fn matches(&self, context: &str, path: &str) -> bool {
        let context = self.resolve(context);
        self.subscriptions.iter().any(|s| s.matches(context, path))
    }

    /// True if some subscription matches the delta's context and at least
    /// one of its paths.
    pub fn matches_delta(&self, delta: &Delta) -> bool {
        let context = self.resolve(&delta.context);
        self.subscriptions
            .iter()
            .filter(|s| s.context.matches(context))
            .any(|s| delta.paths().any(|p| s.path.matches(p)))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
