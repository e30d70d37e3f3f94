//! State planner
//!
//! Treats system state as a weighted directed graph. A planner invocation
//! locates the current state (racing async checks ordered by graph distance
//! to the target, then sequential checks), finds a minimum-cost path with
//! Dijkstra (A* with a zero heuristic), and walks the edges: each
//! transition task runs with retries and counts only when relocation lands
//! on the edge's target state. Progress streams as events on the `planner`
//! channel; failure is reported to the caller as `false` with a
//! `PLANNER_FAILED` event carrying the reason.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aura_core::event::{self, Event, CHANNEL_PLANNER};
use aura_core::model::states::{StateMapSpec, TransitionRetry, TransitionSpec};
use aura_core::template::truthy;
use futures::stream::{FuturesUnordered, StreamExt};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::engine::RunStatus;
use crate::orchestrator::Orchestrator;
use crate::pause::PauseGate;

/// Why a planner invocation failed
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    #[error("cannot determine current state")]
    CannotLocateState,

    #[error("no path from '{from}' to '{to}'")]
    NoPath { from: String, to: String },

    #[error("unknown state '{0}'")]
    UnknownState(String),

    #[error("transition '{task}' ({from} -> {to}) failed after {attempts} attempts")]
    TransitionFailed {
        task: String,
        from: String,
        to: String,
        attempts: u32,
    },
}

struct CheckEntry {
    state: String,
    task: String,
    can_async: bool,
    priority: i64,
    distance: u32,
}

/// One planner invocation over a loaded state map
pub struct StatePlanner {
    spec: Arc<StateMapSpec>,
    orchestrator: Arc<Orchestrator>,
    default_cost: u32,
    graph: DiGraph<String, (u32, usize)>,
    nodes: HashMap<String, NodeIndex>,
}

impl StatePlanner {
    pub fn new(
        spec: Arc<StateMapSpec>,
        orchestrator: Arc<Orchestrator>,
        default_cost: u32,
    ) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for name in spec.states.keys() {
            let index = graph.add_node(name.clone());
            nodes.insert(name.clone(), index);
        }
        for (i, transition) in spec.transitions.iter().enumerate() {
            match (nodes.get(&transition.from), nodes.get(&transition.to)) {
                (Some(&from), Some(&to)) => {
                    let cost = transition.cost.unwrap_or(default_cost);
                    graph.add_edge(from, to, (cost, i));
                }
                _ => {
                    warn!(
                        from = %transition.from,
                        to = %transition.to,
                        "transition references an undeclared state, ignored"
                    );
                }
            }
        }
        Self {
            spec,
            orchestrator,
            default_cost,
            graph,
            nodes,
        }
    }

    /// Drive the system into `target`. Errors surface as `false`.
    pub async fn ensure_state(&self, target: &str) -> bool {
        match self.run(target).await {
            Ok(()) => {
                self.emit(event::PLANNER_SUCCEEDED, json!({"target": target}))
                    .await;
                true
            }
            Err(err) => {
                error!(target, %err, "planner failed");
                self.emit(
                    event::PLANNER_FAILED,
                    json!({"target": target, "reason": err.to_string()}),
                )
                .await;
                false
            }
        }
    }

    async fn run(&self, target: &str) -> Result<(), PlannerError> {
        self.emit(event::PLANNER_STARTED, json!({"target": target}))
            .await;
        if !self.nodes.contains_key(target) {
            return Err(PlannerError::UnknownState(target.to_string()));
        }
        self.emit(
            event::PLANNER_MAP_LOADED,
            json!({
                "states": self.spec.states.len(),
                "transitions": self.spec.transitions.len(),
                "default_cost": self.default_cost,
            }),
        )
        .await;

        let current = self
            .locate(target)
            .await
            .ok_or(PlannerError::CannotLocateState)?;
        self.emit(event::PLANNER_STATE_LOCATED, json!({"state": current}))
            .await;

        if current == target {
            debug!(state = %current, "already in target state");
            return Ok(());
        }

        let (cost, path) = self.find_path(&current, target)?;
        let names: Vec<&str> = path
            .iter()
            .map(|&idx| self.graph[idx].as_str())
            .collect();
        info!(?names, cost, "path found");
        self.emit(
            event::PLANNER_PATH_FOUND,
            json!({"path": names, "cost": cost}),
        )
        .await;

        for pair in path.windows(2) {
            let transition = self
                .edge_transition(pair[0], pair[1])
                .ok_or_else(|| PlannerError::NoPath {
                    from: self.graph[pair[0]].clone(),
                    to: self.graph[pair[1]].clone(),
                })?;
            self.execute_transition(transition, target).await?;
        }
        Ok(())
    }

    /// Minimum-cost path via A* with a zero heuristic.
    fn find_path(
        &self,
        from: &str,
        to: &str,
    ) -> Result<(u32, Vec<NodeIndex>), PlannerError> {
        let (&start, &goal) = match (self.nodes.get(from), self.nodes.get(to)) {
            (Some(start), Some(goal)) => (start, goal),
            _ => {
                return Err(PlannerError::NoPath {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
        };
        petgraph::algo::astar(
            &self.graph,
            start,
            |node| node == goal,
            |edge| edge.weight().0,
            |_| 0,
        )
        .ok_or_else(|| PlannerError::NoPath {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    fn edge_transition(&self, from: NodeIndex, to: NodeIndex) -> Option<&TransitionSpec> {
        self.graph
            .edges_connecting(from, to)
            .min_by_key(|edge| edge.weight().0)
            .map(|edge| &self.spec.transitions[edge.weight().1])
    }

    async fn execute_transition(
        &self,
        transition: &TransitionSpec,
        target: &str,
    ) -> Result<(), PlannerError> {
        let retry = transition.retry.unwrap_or_default();
        let attempts = retry.attempts.max(1);

        self.emit(
            event::PLANNER_STEP_EXECUTING,
            json!({
                "from": transition.from,
                "to": transition.to,
                "task": transition.transition_task,
            }),
        )
        .await;

        for attempt in 0..attempts {
            if attempt > 0 && retry.delay_sec > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(retry.delay_sec)).await;
            }

            let run = Arc::clone(&self.orchestrator)
                .execute_task(&transition.transition_task, None, PauseGate::new())
                .await;
            match run {
                Ok(outcome) if outcome.status == RunStatus::Success => {}
                Ok(outcome) => {
                    warn!(
                        task = %transition.transition_task,
                        status = ?outcome.status,
                        attempt = attempt + 1,
                        "transition task did not succeed"
                    );
                    continue;
                }
                Err(err) => {
                    warn!(
                        task = %transition.transition_task,
                        %err,
                        attempt = attempt + 1,
                        "transition task errored"
                    );
                    continue;
                }
            }

            if retry.post_delay_sec > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(retry.post_delay_sec)).await;
            }

            // Only arriving at the edge's target counts
            match self.locate(target).await {
                Some(located) if located == transition.to => {
                    self.emit(
                        event::PLANNER_STEP_COMPLETED,
                        json!({"from": transition.from, "to": transition.to}),
                    )
                    .await;
                    return Ok(());
                }
                located => {
                    warn!(
                        expected = %transition.to,
                        located = ?located,
                        attempt = attempt + 1,
                        "post-transition verification failed"
                    );
                }
            }
        }

        Err(PlannerError::TransitionFailed {
            task: transition.transition_task.clone(),
            from: transition.from.clone(),
            to: transition.to.clone(),
            attempts,
        })
    }

    /// Determine the current state: racing async checks first, ordered by
    /// `(distance to target, priority)`, then sequential checks in order.
    pub async fn locate(&self, target: &str) -> Option<String> {
        let distances = self.distances_to(target);

        let mut checks: Vec<CheckEntry> = self
            .spec
            .states
            .iter()
            .filter_map(|(name, state)| {
                state.check_task.as_ref().map(|task| CheckEntry {
                    state: name.clone(),
                    task: task.clone(),
                    can_async: state.can_async,
                    priority: state.priority,
                    distance: self
                        .nodes
                        .get(name)
                        .and_then(|idx| distances.get(idx))
                        .copied()
                        .unwrap_or(u32::MAX),
                })
            })
            .collect();
        checks.sort_by_key(|c| (c.distance, c.priority));

        let (parallel, sequential): (Vec<_>, Vec<_>) =
            checks.into_iter().partition(|c| c.can_async);

        if !parallel.is_empty() {
            debug!(count = parallel.len(), "racing parallel state checks");
            let mut futures: FuturesUnordered<_> = parallel
                .iter()
                .map(|check| {
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let task = check.task.clone();
                    let state = check.state.clone();
                    async move {
                        let result = orchestrator
                            .execute_task(&task, None, PauseGate::new())
                            .await;
                        (state, task, result)
                    }
                })
                .collect();

            // First confirmed state wins; dropping the set cancels the rest
            while let Some((state, task, result)) = futures.next().await {
                match result {
                    Ok(outcome)
                        if outcome.status == RunStatus::Success
                            && check_confirms(&outcome.output) =>
                    {
                        info!(state = %state, "current state confirmed");
                        return Some(state);
                    }
                    Ok(_) => {}
                    Err(err) => warn!(task = %task, %err, "state check errored"),
                }
            }
        }

        for check in &sequential {
            debug!(state = %check.state, "sequential state check");
            match Arc::clone(&self.orchestrator)
                .execute_task(&check.task, None, PauseGate::new())
                .await
            {
                Ok(outcome)
                    if outcome.status == RunStatus::Success
                        && check_confirms(&outcome.output) =>
                {
                    info!(state = %check.state, "current state confirmed");
                    return Some(check.state.clone());
                }
                Ok(_) => {}
                Err(err) => warn!(task = %check.task, %err, "state check errored"),
            }
        }

        error!("no state check succeeded, current state unknown");
        None
    }

    /// Unweighted BFS distance from every node to `target`.
    fn distances_to(&self, target: &str) -> HashMap<NodeIndex, u32> {
        let mut distances = HashMap::new();
        let Some(&start) = self.nodes.get(target) else {
            return distances;
        };
        distances.insert(start, 0);
        let mut queue = std::collections::VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            let next = distances[&node] + 1;
            for predecessor in self.graph.neighbors_directed(node, Direction::Incoming) {
                if !distances.contains_key(&predecessor) {
                    distances.insert(predecessor, next);
                    queue.push_back(predecessor);
                }
            }
        }
        distances
    }

    async fn emit(&self, name: &str, mut payload: Value) {
        if let Some(map) = payload.as_object_mut() {
            map.insert(
                "plan".to_string(),
                Value::String(self.orchestrator.plan_name().to_string()),
            );
        }
        self.orchestrator
            .env()
            .bus
            .publish(Event::with_channel(name, payload, CHANNEL_PLANNER))
            .await;
    }
}

/// A check confirms its state when its rendered outputs carry a truthy
/// user value: the `result` key when present, otherwise the whole output.
fn check_confirms(output: &Option<Value>) -> bool {
    match output {
        Some(Value::Object(map)) => match map.get("result") {
            Some(result) => truthy(result),
            None => !map.is_empty(),
        },
        Some(other) => truthy(other),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aura_core::model::states::StateSpec;
    use aura_core::Config;
    use serde_json::Map;

    fn spec(yaml: &str) -> Arc<StateMapSpec> {
        Arc::new(serde_yaml::from_str(yaml).unwrap())
    }

    fn dummy_orchestrator() -> Arc<Orchestrator> {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plans/demo");
        std::fs::create_dir_all(plan.join("tasks")).unwrap();
        let env = crate::env::RuntimeEnv::new(Config::new());
        // The temp dir may be dropped; path-only usage is fine for graph tests
        Arc::new(Orchestrator::new("demo", &plan, Arc::new(env), Map::new()))
    }

    #[test]
    fn test_cheapest_path_wins() {
        let spec = spec(
            r#"
states:
  A: {}
  B: {}
  C: {}
transitions:
  - {from: A, to: B, cost: 5, transition_task: moves/direct}
  - {from: A, to: C, cost: 1, transition_task: moves/via_c}
  - {from: C, to: B, cost: 1, transition_task: moves/c_to_b}
"#,
        );
        let planner = StatePlanner::new(spec, dummy_orchestrator(), 1);
        let (cost, path) = planner.find_path("A", "B").unwrap();
        assert_eq!(cost, 2);
        let names: Vec<&str> = path.iter().map(|&i| planner.graph[i].as_str()).collect();
        assert_eq!(names, vec!["A", "C", "B"]);
    }

    #[test]
    fn test_no_path_is_an_error() {
        let spec = spec(
            "states:\n  A: {}\n  B: {}\ntransitions:\n  - {from: B, to: A, transition_task: t}\n",
        );
        let planner = StatePlanner::new(spec, dummy_orchestrator(), 1);
        assert!(matches!(
            planner.find_path("A", "B"),
            Err(PlannerError::NoPath { .. })
        ));
    }

    #[test]
    fn test_default_cost_applies_to_unweighted_edges() {
        let spec = spec(
            r#"
states:
  A: {}
  B: {}
  C: {}
transitions:
  - {from: A, to: B, cost: 3, transition_task: direct}
  - {from: A, to: C, transition_task: hop1}
  - {from: C, to: B, transition_task: hop2}
"#,
        );
        // With default cost 2 the two-hop route costs 4, direct wins
        let planner = StatePlanner::new(spec, dummy_orchestrator(), 2);
        let (cost, path) = planner.find_path("A", "B").unwrap();
        assert_eq!(cost, 3);
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn test_bfs_distances() {
        let spec = spec(
            r#"
states:
  A: {}
  B: {}
  C: {}
transitions:
  - {from: A, to: C, transition_task: t1}
  - {from: C, to: B, transition_task: t2}
"#,
        );
        let planner = StatePlanner::new(spec, dummy_orchestrator(), 1);
        let distances = planner.distances_to("B");
        assert_eq!(distances[&planner.nodes["B"]], 0);
        assert_eq!(distances[&planner.nodes["C"]], 1);
        assert_eq!(distances[&planner.nodes["A"]], 2);
    }

    #[test]
    fn test_check_confirms_semantics() {
        assert!(check_confirms(&Some(json!({"result": true}))));
        assert!(!check_confirms(&Some(json!({"result": false}))));
        assert!(check_confirms(&Some(json!({"anything": 1}))));
        assert!(check_confirms(&Some(json!(true))));
        assert!(!check_confirms(&Some(json!(false))));
        assert!(!check_confirms(&None));
    }

    #[test]
    fn test_unknown_state_in_transition_is_ignored() {
        let spec_data = spec(
            "states:\n  A: {}\ntransitions:\n  - {from: A, to: Ghost, transition_task: t}\n",
        );
        let planner = StatePlanner::new(spec_data, dummy_orchestrator(), 1);
        assert_eq!(planner.graph.edge_count(), 0);
    }

    #[test]
    fn test_state_spec_defaults() {
        let state: StateSpec = serde_yaml::from_str("check_task: checks/x\n").unwrap();
        assert!(state.can_async);
        assert_eq!(state.priority, 100);
    }
}
