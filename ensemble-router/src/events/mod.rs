//! Typed router notifications
//!
//! Components publish [`EnsembleEvent`]s on a shared [`EventBus`] instead of
//! calling into observers directly. Health dashboards, metrics exporters, and
//! audit logs subscribe; the router never waits on them.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Dispatcher  │────▶│  Event Bus   │────▶│  Subscribers │
//! │  Service     │     │  (broadcast) │     │   (recv)     │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::{BudgetScope, EnsembleEvent};
