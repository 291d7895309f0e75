/// Board services the node needs besides networking and storage.
pub trait System {
    fn feed_watchdog(&mut self);

    /// Blocks the calling thread.
    fn delay_ms(&mut self, ms: u32);

    /// Reboots. On hardware this does not return; simulated platforms record
    /// the request and the node reports [`TickOutcome::Restart`].
    ///
    /// [`TickOutcome::Restart`]: crate::node::TickOutcome::Restart
    fn restart(&mut self);

    /// Falls back to the provisioning portal after repeated link failures.
    fn enter_provisioning(&mut self) {}

    fn free_memory(&self) -> u32;

    fn wifi_rssi(&self) -> Option<i32> {
        None
    }
}
