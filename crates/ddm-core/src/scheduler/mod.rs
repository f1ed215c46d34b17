//! Queue dispatcher (C6): ties the in-memory task queue to the coordinator
//! (C4), the global connection budget, and the history ledger.

mod budget;
mod dispatch;

pub use budget::GlobalConnectionBudget;
pub use dispatch::Dispatcher;
