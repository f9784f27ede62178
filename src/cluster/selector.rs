/// Server selection algorithms
use crate::config::{SelectionConfig, SelectionPolicy};
use crate::core::{ServerRecord, ServerRole};
use crate::error::{DriverError, DriverResult};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which servers may serve an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl fmt::Display for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Routing::Primary => "primary",
            Routing::PrimaryPreferred => "primary_preferred",
            Routing::Secondary => "secondary",
            Routing::SecondaryPreferred => "secondary_preferred",
            Routing::Nearest => "nearest",
        };
        write!(f, "{}", name)
    }
}

fn usable(server: &ServerRecord) -> bool {
    server.reachable && server.role != ServerRole::Arbiter
}

fn primary_class(server: &ServerRecord) -> bool {
    usable(server) && server.role.is_writable()
}

// Standalone servers and routers are all there is, so they serve secondary reads too.
fn secondary_class(server: &ServerRecord) -> bool {
    usable(server)
        && matches!(
            server.role,
            ServerRole::Secondary | ServerRole::Standalone | ServerRole::Mongos
        )
}

/// Servers that satisfy `routing`, with preferred variants falling back to
/// the other class when the preferred one is empty.
pub fn eligible<'a>(candidates: &'a [ServerRecord], routing: &Routing) -> Vec<&'a ServerRecord> {
    let filter = |class: fn(&ServerRecord) -> bool| -> Vec<&'a ServerRecord> {
        candidates.iter().filter(|s| class(s)).collect()
    };
    let prefer = |first: fn(&ServerRecord) -> bool, second: fn(&ServerRecord) -> bool| {
        let preferred = filter(first);
        if preferred.is_empty() {
            filter(second)
        } else {
            preferred
        }
    };

    match routing {
        Routing::Primary => filter(primary_class),
        Routing::Secondary => filter(secondary_class),
        Routing::PrimaryPreferred => prefer(primary_class, secondary_class),
        Routing::SecondaryPreferred => prefer(secondary_class, primary_class),
        Routing::Nearest => filter(usable),
    }
}

/// Picks one server for an operation
pub trait ServerSelector: Send + Sync {
    /// Choose among `candidates` a server satisfying `routing`.
    fn select(&self, candidates: &[ServerRecord], routing: &Routing) -> DriverResult<ServerRecord>;

    /// Name used in logs
    fn name(&self) -> &'static str;
}

/// Uniform choice among the servers within `window` of the fastest one
#[derive(Debug, Clone)]
pub struct LatencyWindowSelector {
    window: Duration,
}

impl LatencyWindowSelector {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl ServerSelector for LatencyWindowSelector {
    fn select(&self, candidates: &[ServerRecord], routing: &Routing) -> DriverResult<ServerRecord> {
        let eligible = eligible(candidates, routing);

        // Servers without a sample only compete when nobody has one.
        let fastest = eligible.iter().filter_map(|s| s.latency).min();
        let within_window: Vec<&ServerRecord> = match fastest {
            Some(fastest) => {
                let limit = fastest + self.window;
                eligible
                    .into_iter()
                    .filter(|s| s.latency.map_or(false, |latency| latency <= limit))
                    .collect()
            }
            None => eligible,
        };

        within_window
            .choose(&mut rand::thread_rng())
            .map(|server| (*server).clone())
            .ok_or_else(|| DriverError::selection(routing.to_string()))
    }

    fn name(&self) -> &'static str {
        "latency_window"
    }
}

/// Rotates through the eligible servers
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerSelector for RoundRobinSelector {
    fn select(&self, candidates: &[ServerRecord], routing: &Routing) -> DriverResult<ServerRecord> {
        let eligible = eligible(candidates, routing);
        if eligible.is_empty() {
            return Err(DriverError::selection(routing.to_string()));
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Ok(eligible[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Build the selector named by the configuration
pub fn from_config(config: &SelectionConfig) -> Arc<dyn ServerSelector> {
    match config.policy {
        SelectionPolicy::LatencyWindow => Arc::new(LatencyWindowSelector::new(config.latency_window())),
        SelectionPolicy::RoundRobin => Arc::new(RoundRobinSelector::new()),
    }
}
