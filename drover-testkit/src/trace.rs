use drover::{HookArgs, HookRegistry, InstanceHooks, Next};
use parking_lot::Mutex;
use std::sync::Arc;

/// Records hook invocations as `"<event>"` or `"<event>:<detail>"` lines.
///
/// The detail is the unit id for perform and failure events, the slot for
/// slot events, the count for `after_fetch` and `forced` / `graceful` for
/// shutdown.
#[derive(Clone, Debug, Default)]
pub struct HookTrace {
    entries: Arc<Mutex<Vec<String>>>,
}

impl HookTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recording hook for each event on the global registry.
    pub fn attach(&self, hooks: &HookRegistry, events: &[&str]) {
        for event in events {
            let trace = self.clone();
            let name = event.to_string();
            hooks.add_hook(*event, move |args: &HookArgs<'_>| trace.record(&name, args));
        }
    }

    /// Register a recording around hook labelled `label` on the global registry.
    ///
    /// Records `"<label>:enter"` and `"<label>:exit"` around the wrapped block.
    pub fn attach_around(&self, hooks: &HookRegistry, event: &str, label: &str) {
        let trace = self.clone();
        let label = label.to_string();
        hooks.add_around_hook(event, move |_: &HookArgs<'_>, next: Next<'_>| {
            trace.push(format!("{label}:enter"));
            let result = next.proceed();
            trace.push(format!("{label}:exit"));
            result
        });
    }

    /// Register a recording instance hook named `name`.
    pub fn attach_instance(&self, hooks: &mut InstanceHooks, event: &str, name: &str) {
        let trace = self.clone();
        let label = format!("{event}[{name}]");
        hooks.on(event, name, move |args: &HookArgs<'_>| trace.record(&label, args));
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    fn record(&self, event: &str, args: &HookArgs<'_>) {
        let detail = match args {
            HookArgs::Fetched { count, .. } => Some(count.to_string()),
            HookArgs::Slot { slot } => Some(slot.to_string()),
            HookArgs::Shutdown { forced } => {
                Some(if *forced { "forced" } else { "graceful" }.to_string())
            }
            _ => args.unit().map(|unit| unit.id().to_string()),
        };
        match detail {
            Some(detail) => self.push(format!("{event}:{detail}")),
            None => self.push(event),
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Entries whose event part equals `event`.
    pub fn count(&self, event: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.split(':').next() == Some(event))
            .count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.lock().iter().any(|recorded| recorded == entry)
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|recorded| recorded == entry)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover::events;

    #[test]
    fn test_records_shutdown_detail_and_around_order() {
        let hooks = HookRegistry::new();
        let trace = HookTrace::new();
        trace.attach(&hooks, &[events::BEFORE_SHUTDOWN]);
        trace.attach_around(&hooks, events::AROUND_PERFORM, "outer");

        hooks
            .run_hooks_for(events::BEFORE_SHUTDOWN, &HookArgs::Shutdown { forced: true })
            .unwrap();
        let args = HookArgs::Shutdown { forced: false };
        let ran = hooks
            .run_around_hooks_for(events::AROUND_PERFORM, &args, || trace.push("block"))
            .unwrap();

        assert!(ran.is_some());
        assert_eq!(
            trace.entries(),
            vec!["before_shutdown:forced", "outer:enter", "block", "outer:exit"]
        );
        assert_eq!(trace.count("before_shutdown"), 1);
    }
}
