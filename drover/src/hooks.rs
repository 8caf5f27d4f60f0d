//! Before / after / around hooks.
//!
//! Hooks are registered against an event name and run at lifecycle points in
//! the fetcher, the worker and the worker strategies. There are two scopes:
//!
//! - global hooks live in a [`HookRegistry`] owned by the process
//!   [`Context`](crate::Context) and run in registration order;
//! - instance hooks are an explicit table ([`InstanceHooks`]) a job fills in
//!   when it is registered; they run after the global hooks, ordered by hook
//!   name.
//!
//! Simple hooks return `()`, `bool`, `anyhow::Result<()>` or
//! `anyhow::Result<bool>`. If any hook returns `false` the aggregate result
//! is `false`; every hook still runs. Errors are returned to the caller as-is.
//!
//! Around hooks receive a [`Next`] continuation. The chain is composed by
//! folding the ordered hooks right-to-left around the wrapped block, so the
//! observed order is U-shaped:
//!
//! ```text
//! before 1, before 2, ..., before N, block, after N, ..., after 2, after 1
//! ```
//!
//! A hook that returns without calling [`Next::proceed`] skips every later
//! hook and the block itself. Each hook adds one stack frame, which is fine
//! for the tens of hooks a real deployment registers.
//!
//! Registration is expected to happen during setup. Running hooks takes a
//! snapshot of the registered list, so a hook may register another without
//! deadlocking, but concurrent registration during execution is not ordered.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::encoding::JobPayload;
use crate::runtime::SlotInfo;
use crate::unit_of_work::UnitOfWork;

/// Well-known event names.
pub mod events {
    pub const BEFORE_FETCH: &str = "before_fetch";
    pub const AFTER_FETCH: &str = "after_fetch";
    pub const BEFORE_PERFORM: &str = "before_perform";
    pub const AFTER_PERFORM: &str = "after_perform";
    pub const AROUND_PERFORM: &str = "around_perform";
    pub const ON_FAILURE: &str = "on_failure";
    pub const ON_FAILURE_EXHAUSTED: &str = "on_failure_exhausted";
    /// Message could not be decoded or names an unknown job.
    pub const ON_REJECTED: &str = "on_rejected";
    /// Parent side, before a child process is spawned.
    pub const BEFORE_FORK: &str = "before_fork";
    /// Child side, before the child starts on its batch.
    pub const AFTER_FORK: &str = "after_fork";
    pub const BEFORE_SLOT_START: &str = "before_slot_start";
    pub const AFTER_SLOT_START: &str = "after_slot_start";
    pub const BEFORE_SHUTDOWN: &str = "before_shutdown";
}

/// Arguments handed to a hook.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub enum HookArgs<'a> {
    /// A fetch is about to be issued.
    Fetch { queue_name: &'a str, batch_size: usize },
    /// A fetch returned `count` units.
    Fetched { queue_name: &'a str, count: usize },
    /// A unit's job is about to run, or just ran.
    Perform {
        unit: &'a UnitOfWork,
        payload: &'a JobPayload,
    },
    /// A unit failed. `payload` is `None` when the message could not be decoded.
    Failure {
        unit: &'a UnitOfWork,
        payload: Option<&'a JobPayload>,
        error: &'a anyhow::Error,
    },
    /// An execution slot is starting.
    Slot { slot: &'a SlotInfo },
    /// The manager is shutting down.
    Shutdown { forced: bool },
}

impl<'a> HookArgs<'a> {
    pub fn queue_name(&self) -> Option<&'a str> {
        match *self {
            HookArgs::Fetch { queue_name, .. } | HookArgs::Fetched { queue_name, .. } => {
                Some(queue_name)
            }
            HookArgs::Perform { unit, .. } | HookArgs::Failure { unit, .. } => {
                Some(unit.queue_name())
            }
            HookArgs::Slot { slot } => Some(slot.queue_name.as_str()),
            HookArgs::Shutdown { .. } => None,
        }
    }

    pub fn unit(&self) -> Option<&'a UnitOfWork> {
        match *self {
            HookArgs::Perform { unit, .. } | HookArgs::Failure { unit, .. } => Some(unit),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&'a JobPayload> {
        match *self {
            HookArgs::Perform { payload, .. } => Some(payload),
            HookArgs::Failure { payload, .. } => payload,
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&'a anyhow::Error> {
        match *self {
            HookArgs::Failure { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<&'a SlotInfo> {
        match *self {
            HookArgs::Slot { slot } => Some(slot),
            _ => None,
        }
    }
}

/// Values a simple hook may return.
pub trait HookResult {
    /// `Ok(false)` vetoes continuation.
    fn into_hook_result(self) -> anyhow::Result<bool>;
}

impl HookResult for () {
    fn into_hook_result(self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

impl HookResult for bool {
    fn into_hook_result(self) -> anyhow::Result<bool> {
        Ok(self)
    }
}

impl HookResult for anyhow::Result<()> {
    fn into_hook_result(self) -> anyhow::Result<bool> {
        self.map(|()| true)
    }
}

impl HookResult for anyhow::Result<bool> {
    fn into_hook_result(self) -> anyhow::Result<bool> {
        self
    }
}

/// A simple (before / after / on_*) hook.
pub trait Hook: Send + Sync {
    fn call(&self, args: &HookArgs<'_>) -> anyhow::Result<bool>;
}

struct FnHook<F, R> {
    f: F,
    _result: PhantomData<fn() -> R>,
}

impl<F, R> Hook for FnHook<F, R>
where
    F: Fn(&HookArgs<'_>) -> R + Send + Sync,
    R: HookResult,
{
    fn call(&self, args: &HookArgs<'_>) -> anyhow::Result<bool> {
        (self.f)(args).into_hook_result()
    }
}

fn simple_hook<F, R>(f: F) -> Arc<dyn Hook>
where
    F: Fn(&HookArgs<'_>) -> R + Send + Sync + 'static,
    R: HookResult + 'static,
{
    Arc::new(FnHook {
        f,
        _result: PhantomData,
    })
}

/// Continuation handed to an around hook.
#[must_use = "an around hook that drops `next` skips the wrapped operation"]
pub struct Next<'a> {
    call: Box<dyn FnOnce() -> anyhow::Result<()> + 'a>,
}

impl Next<'_> {
    /// Run the next hook in the chain, or the wrapped block if this is the last.
    pub fn proceed(self) -> anyhow::Result<()> {
        (self.call)()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// An around hook.
pub trait AroundHook: Send + Sync {
    fn call(&self, args: &HookArgs<'_>, next: Next<'_>) -> anyhow::Result<()>;
}

impl<F> AroundHook for F
where
    F: Fn(&HookArgs<'_>, Next<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn call(&self, args: &HookArgs<'_>, next: Next<'_>) -> anyhow::Result<()> {
        self(args, next)
    }
}

#[derive(Default)]
struct HookTable {
    simple: HashMap<String, Vec<Arc<dyn Hook>>>,
    around: HashMap<String, Vec<Arc<dyn AroundHook>>>,
}

/// Process-wide hook registry.
#[derive(Default)]
pub struct HookRegistry {
    table: RwLock<HookTable>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.read();
        let simple: BTreeMap<&str, usize> = table
            .simple
            .iter()
            .map(|(event, hooks)| (event.as_str(), hooks.len()))
            .collect();
        let around: BTreeMap<&str, usize> = table
            .around
            .iter()
            .map(|(event, hooks)| (event.as_str(), hooks.len()))
            .collect();
        f.debug_struct("HookRegistry")
            .field("simple", &simple)
            .field("around", &around)
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a simple hook for `event`.
    pub fn add_hook<F, R>(&self, event: impl Into<String>, hook: F)
    where
        F: Fn(&HookArgs<'_>) -> R + Send + Sync + 'static,
        R: HookResult + 'static,
    {
        self.table
            .write()
            .simple
            .entry(event.into())
            .or_default()
            .push(simple_hook(hook));
    }

    /// Append an around hook for `event`.
    pub fn add_around_hook<F>(&self, event: impl Into<String>, hook: F)
    where
        F: Fn(&HookArgs<'_>, Next<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.table
            .write()
            .around
            .entry(event.into())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Remove every registered hook.
    pub fn clear_hooks(&self) {
        let mut table = self.table.write();
        table.simple.clear();
        table.around.clear();
    }

    /// Number of simple plus around hooks registered for `event`.
    pub fn count(&self, event: &str) -> usize {
        let table = self.table.read();
        table.simple.get(event).map_or(0, Vec::len)
            + table.around.get(event).map_or(0, Vec::len)
    }

    pub fn hooks_for(&self, event: &str) -> Vec<Arc<dyn Hook>> {
        self.table
            .read()
            .simple
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    pub fn around_hooks_for(&self, event: &str) -> Vec<Arc<dyn AroundHook>> {
        self.table
            .read()
            .around
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    /// Run the global simple hooks for `event`.
    pub fn run_hooks_for(&self, event: &str, args: &HookArgs<'_>) -> anyhow::Result<bool> {
        self.run_hooks_with(event, args, None)
    }

    /// Run global hooks, then the instance hooks, for `event`.
    pub fn run_hooks_with(
        &self,
        event: &str,
        args: &HookArgs<'_>,
        instance: Option<&InstanceHooks>,
    ) -> anyhow::Result<bool> {
        let mut hooks = self.hooks_for(event);
        if let Some(instance) = instance {
            hooks.extend(instance.hooks_for(event));
        }

        let mut proceed = true;
        for hook in &hooks {
            if !hook.call(args)? {
                proceed = false;
            }
        }
        Ok(proceed)
    }

    /// Run the global around hooks for `event` wrapped around `block`.
    ///
    /// Returns `Ok(None)` if a hook did not call its continuation.
    pub fn run_around_hooks_for<T>(
        &self,
        event: &str,
        args: &HookArgs<'_>,
        block: impl FnOnce() -> T,
    ) -> anyhow::Result<Option<T>> {
        self.run_around_hooks_with(event, args, None, block)
    }

    /// Like [`run_around_hooks_for`](Self::run_around_hooks_for), with the
    /// instance's around hooks nested inside the global ones.
    pub fn run_around_hooks_with<T>(
        &self,
        event: &str,
        args: &HookArgs<'_>,
        instance: Option<&InstanceHooks>,
        block: impl FnOnce() -> T,
    ) -> anyhow::Result<Option<T>> {
        let mut hooks = self.around_hooks_for(event);
        if let Some(instance) = instance {
            hooks.extend(instance.around_hooks_for(event));
        }
        compose_around(&hooks, args, block)
    }
}

fn compose_around<T>(
    hooks: &[Arc<dyn AroundHook>],
    args: &HookArgs<'_>,
    block: impl FnOnce() -> T,
) -> anyhow::Result<Option<T>> {
    let mut output = None;
    {
        let output_slot = &mut output;
        let mut chain: Box<dyn FnOnce() -> anyhow::Result<()> + '_> =
            Box::new(move || {
                *output_slot = Some(block());
                Ok(())
            });
        for hook in hooks.iter().rev() {
            let next = Next { call: chain };
            chain = Box::new(move || hook.call(args, next));
        }
        chain()?;
    }
    Ok(output)
}

/// Hooks declared by a job.
///
/// Entries are keyed by event and hook name; hooks for one event run in
/// lexical name order and re-registering a name replaces the earlier hook.
#[derive(Clone, Default)]
pub struct InstanceHooks {
    simple: BTreeMap<String, BTreeMap<String, Arc<dyn Hook>>>,
    around: BTreeMap<String, BTreeMap<String, Arc<dyn AroundHook>>>,
}

impl fmt::Debug for InstanceHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn names<V>(table: &BTreeMap<String, BTreeMap<String, V>>) -> Vec<String> {
            table
                .iter()
                .flat_map(|(event, hooks)| hooks.keys().map(move |name| format!("{event}:{name}")))
                .collect()
        }

        f.debug_struct("InstanceHooks")
            .field("simple", &names(&self.simple))
            .field("around", &names(&self.around))
            .finish()
    }
}

impl InstanceHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a simple hook `name` for `event`.
    pub fn on<F, R>(
        &mut self,
        event: impl Into<String>,
        name: impl Into<String>,
        hook: F,
    ) -> &mut Self
    where
        F: Fn(&HookArgs<'_>) -> R + Send + Sync + 'static,
        R: HookResult + 'static,
    {
        self.simple
            .entry(event.into())
            .or_default()
            .insert(name.into(), simple_hook(hook));
        self
    }

    /// Declare an around hook `name` for `event`.
    pub fn around<F>(
        &mut self,
        event: impl Into<String>,
        name: impl Into<String>,
        hook: F,
    ) -> &mut Self
    where
        F: Fn(&HookArgs<'_>, Next<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.around
            .entry(event.into())
            .or_default()
            .insert(name.into(), Arc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.simple.is_empty() && self.around.is_empty()
    }

    pub fn hooks_for(&self, event: &str) -> Vec<Arc<dyn Hook>> {
        self.simple
            .get(event)
            .map(|hooks| hooks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn around_hooks_for(&self, event: &str) -> Vec<Arc<dyn AroundHook>> {
        self.around
            .get(event)
            .map(|hooks| hooks.values().cloned().collect())
            .unwrap_or_default()
    }
}
