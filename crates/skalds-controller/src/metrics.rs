//! Metric names and label keys for the controller.
//!
//! Centralized so dashboards and alerts have one place to look.

/// Metric names.
pub mod names {
    /// Tasks assigned by the dispatcher.
    pub const DISPATCH_ASSIGNED_TOTAL: &str = "skalds_dispatch_assigned_total";
    /// Dispatchable tasks left unassigned in a tick (no candidate).
    pub const DISPATCH_UNPLACED_TOTAL: &str = "skalds_dispatch_unplaced_total";
    /// Lifecycle transitions applied by the reconciler.
    pub const RECONCILE_TRANSITIONS_TOTAL: &str = "skalds_reconcile_transitions_total";
    /// CAS races lost (treated as success).
    pub const RECONCILE_CAS_LOST_TOTAL: &str = "skalds_reconcile_cas_lost_total";
    /// Assigning tasks demoted back to Created.
    pub const ASSIGNMENT_TIMEOUTS_TOTAL: &str = "skalds_assignment_timeouts_total";
    /// Orphan cancellation events emitted.
    pub const ORPHAN_CANCELS_TOTAL: &str = "skalds_orphan_cancels_total";
    /// Monitor cycles that failed and were skipped.
    pub const MONITOR_CYCLE_FAILURES_TOTAL: &str = "skalds_monitor_cycle_failures_total";
    /// Registered skalds by derived status.
    pub const SKALDS_REGISTERED: &str = "skalds_registered";
    /// Tasks currently in the monitored set.
    pub const TASKS_MONITORED: &str = "skalds_tasks_monitored";
    /// Connected server-push clients.
    pub const SSE_CONNECTED_CLIENTS: &str = "skalds_sse_connected_clients";
}

/// Label keys.
pub mod labels {
    /// Target lifecycle status of a transition.
    pub const TO: &str = "to";
    /// Reason attached to a transition.
    pub const REASON: &str = "reason";
    /// Component emitting the sample.
    pub const COMPONENT: &str = "component";
    /// Derived skald status.
    pub const STATUS: &str = "status";
}
