//! Observer callback slots. One handler per topic; registering a new one
//! overwrites whatever was previously registered (per the protocol's
//! single-slot-per-topic contract). The original's `void *user` pointer has
//! no Rust equivalent here — closures capture their own state instead.

use std::sync::Arc;

use crate::node::Node;
use crate::Discover;

type NodeObserver = Arc<dyn Fn(&Discover, &Node) + Send + Sync>;
type UnitObserver = Arc<dyn Fn(&Discover) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&Discover, &str) + Send + Sync>;

#[derive(Default, Clone)]
pub struct Observers {
    pub hello_received: Option<NodeObserver>,
    pub hello_emitted: Option<UnitObserver>,
    pub promotion: Option<UnitObserver>,
    pub demotion: Option<UnitObserver>,
    pub check: Option<UnitObserver>,
    pub added: Option<NodeObserver>,
    pub master: Option<NodeObserver>,
    pub removed: Option<NodeObserver>,
    pub error: Option<ErrorObserver>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }
}
