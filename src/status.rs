//! Status snapshot surface for external dashboards.
//!
//! The dashboards themselves live outside this crate; the core only
//! promises a bounded snapshot. Subsystems register cheap providers (metric
//! summaries, state labels) and `snapshot` collects them under a hard time
//! budget so a stuck provider cannot stall a render loop.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::models::now_ms;

/// Collection budget per snapshot call.
pub const SNAPSHOT_BUDGET: Duration = Duration::from_millis(500);

type Provider = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct StatusField {
    pub name: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub generated_at_ms: i64,
    pub complete: bool,
    pub fields: Vec<StatusField>,
}

impl EngineStatus {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

#[derive(Default)]
pub struct StatusRegistry {
    providers: RwLock<Vec<(&'static str, Provider)>>,
}

impl StatusRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &'static str, provider: Provider) {
        self.providers.write().push((name, provider));
    }

    /// Collect every provider, in registration order, under the budget.
    /// Providers that miss the cut are dropped and the snapshot is marked
    /// incomplete.
    pub fn snapshot(&self, budget: Duration) -> EngineStatus {
        let started = Instant::now();
        let providers = self.providers.read().clone();
        let mut fields = Vec::with_capacity(providers.len());
        let mut complete = true;

        for (name, provider) in providers {
            if started.elapsed() >= budget {
                warn!(skipped_from = name, "status_snapshot_over_budget");
                complete = false;
                break;
            }
            fields.push(StatusField {
                name,
                value: provider(),
            });
        }

        EngineStatus {
            generated_at_ms: now_ms(),
            complete,
            fields,
        }
    }
}
