use crate::clock::Millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTask<T> {
    pub id: T,
    pub interval_ms: u32,
    pub last_fire: Millis,
}

/// Independent fixed-interval duties polled from the main loop. Intervals are
/// not phase-aligned; each task only remembers when it last fired.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatScheduler<T> {
    tasks: Vec<ScheduledTask<T>>,
}

impl<T: Copy> HeartbeatScheduler<T> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// The first fire comes one full interval after `now`.
    pub fn register(&mut self, id: T, interval_ms: u32, now: Millis) {
        self.tasks.push(ScheduledTask {
            id,
            interval_ms,
            last_fire: now,
        });
    }

    /// Returns the due tasks in registration order and re-arms them at `now`.
    pub fn tick(&mut self, now: Millis) -> Vec<T> {
        let mut due = Vec::new();
        for task in &mut self.tasks {
            if now.has_elapsed(task.last_fire, task.interval_ms) {
                task.last_fire = now;
                due.push(task.id);
            }
        }
        due
    }

    pub fn tasks(&self) -> &[ScheduledTask<T>] {
        &self.tasks
    }
}
