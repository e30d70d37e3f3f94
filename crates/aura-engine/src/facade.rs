//! Scheduler facade
//!
//! The single entry point. Owns the runtime environment, the shared state,
//! the execution manager, and the background services (scheduling,
//! interrupts, commander, event workers), and exposes the public query,
//! execution, and mutation API consumed by the CLI and any outer layers.
//!
//! The reload pipeline runs at construction and on demand: configuration,
//! plugins (services, actions, orchestrators), plan data (schedules,
//! interrupt rules, task definitions), and finally the event-trigger
//! subscriptions that bridge bus events to tasklets.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use aura_core::event::Event;
use aura_core::model::interrupt::{InterruptFile, InterruptScope};
use aura_core::{ConfigError, InterruptRule, ScheduleItem, Tasklet};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actions::builtin::{register_builtin_actions, register_core_services};
use crate::bus::EventBus;
use crate::commander::Commander;
use crate::container::ServiceInfo;
use crate::env::RuntimeEnv;
use crate::hooks::HookManager;
use crate::interrupts::InterruptService;
use crate::manager::{ExecutionManager, SubmitError, TaskRunResult};
use crate::plugin::loader::ProviderCatalog;
use crate::plugin::{PluginError, PluginManager};
use crate::queue::QueueError;
use crate::scheduling::SchedulingService;
use crate::state::{RunRecord, SharedState, TimelineEntry};

/// Facade-level failures
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    #[error("task definition '{0}' not found")]
    TaskNotFound(String),

    #[error("schedule item '{0}' not found")]
    ScheduleItemNotFound(String),

    #[error("task '{0}' is already queued or running")]
    AlreadyQueued(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("failed to write {path}: {detail}")]
    SaveFailed { path: String, detail: String },
}

/// Aggregate status for `status` queries
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub plans: usize,
    pub tasks: usize,
    pub actions: usize,
    pub services: usize,
    pub queued_tasklets: usize,
    pub active_runs: usize,
}

/// Public description of one action
#[derive(Debug, Clone, Serialize)]
pub struct ActionInfo {
    pub name: String,
    pub fqid: String,
    pub read_only: bool,
    pub public: bool,
}

/// One running task, for observation APIs
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub task_fqid: String,
    pub started_at: chrono::DateTime<Utc>,
    pub is_interrupt_handler: bool,
}

/// Queue depths for observation APIs
#[derive(Debug, Clone, Serialize)]
pub struct QueueOverview {
    pub task_queue: usize,
    pub event_task_queue: usize,
    pub interrupt_queue: usize,
    pub active_runs: usize,
}

const EVENT_WORKERS: usize = 2;

/// The execution core's front door
pub struct Scheduler {
    base_path: PathBuf,
    env: Arc<RuntimeEnv>,
    shared: Arc<SharedState>,
    hooks: Arc<HookManager>,
    manager: Arc<ExecutionManager>,
    plugins: tokio::sync::Mutex<PluginManager>,
    catalog: ProviderCatalog,
    service_handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the facade and load all framework resources.
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self, FacadeError> {
        let base_path = base_path.into();
        let env = Arc::new(RuntimeEnv::new(aura_core::Config::new()));
        register_builtin_actions(&env.actions);
        register_core_services(
            &env.services,
            env.config.clone(),
            Arc::clone(&env.state_store),
            Arc::clone(&env.bus),
        );

        let shared = Arc::new(SharedState::new());
        let hooks = Arc::new(HookManager::new());
        let manager = Arc::new(ExecutionManager::new(
            Arc::clone(&shared),
            Arc::clone(&hooks),
        ));
        let catalog = ProviderCatalog::with_builtins(&env);

        let scheduler = Self {
            plugins: tokio::sync::Mutex::new(PluginManager::new(&base_path)),
            base_path,
            env,
            shared,
            hooks,
            manager,
            catalog,
            service_handles: tokio::sync::Mutex::new(Vec::new()),
        };
        scheduler.reload_plans().await?;
        Ok(scheduler)
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.env.bus
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Reload everything: config, plugins, plan data, event triggers.
    pub async fn reload_plans(&self) -> Result<(), FacadeError> {
        info!("======= loading framework resources =======");
        self.env.config.load_environment(&self.base_path)?;
        self.env.config.clear_plan_configs();
        self.env.services.retain_prefix("core/");
        self.env.actions.clear();
        register_builtin_actions(&self.env.actions);
        self.hooks.clear().await;

        {
            let mut plugins = self.plugins.lock().await;
            plugins
                .load_all(&self.env, &self.shared, &self.hooks, &self.catalog)
                .await?;
        }

        self.load_plan_data().await;
        self.env.bus.clear_subscriptions().await;
        self.subscribe_event_triggers().await;

        let status = self.status().await;
        info!(
            plans = status.plans,
            tasks = status.tasks,
            actions = status.actions,
            services = status.services,
            "======= framework resources loaded ======="
        );
        Ok(())
    }

    /// Load per-plan schedules, interrupt rules, and task definitions.
    async fn load_plan_data(&self) {
        self.shared.schedule_items.write().await.clear();
        self.shared.interrupt_rules.write().await.clear();
        self.shared.user_enabled_globals.write().await.clear();
        self.shared.task_definitions.write().await.clear();

        let plans: Vec<(String, Arc<crate::orchestrator::Orchestrator>)> = self
            .shared
            .plans
            .read()
            .await
            .iter()
            .map(|(name, orch)| (name.clone(), Arc::clone(orch)))
            .collect();

        for (plan_name, orchestrator) in plans {
            let plan_path = orchestrator.plan_path().to_path_buf();

            // schedule.yaml
            let schedule_path = plan_path.join("schedule.yaml");
            if schedule_path.is_file() {
                match std::fs::read_to_string(&schedule_path)
                    .map_err(|e| e.to_string())
                    .and_then(|text| {
                        serde_yaml::from_str::<Vec<ScheduleItem>>(&text).map_err(|e| e.to_string())
                    }) {
                    Ok(items) => {
                        let mut all = self.shared.schedule_items.write().await;
                        let mut statuses = self.shared.run_statuses.write().await;
                        for mut item in items {
                            item.plan_name = plan_name.clone();
                            statuses.entry(item.id.clone()).or_default();
                            all.push(item);
                        }
                    }
                    Err(err) => {
                        error!(path = %schedule_path.display(), %err, "schedule file unreadable")
                    }
                }
            }

            // interrupts.yaml
            let interrupts_path = plan_path.join("interrupts.yaml");
            if interrupts_path.is_file() {
                match std::fs::read_to_string(&interrupts_path)
                    .map_err(|e| e.to_string())
                    .and_then(|text| {
                        serde_yaml::from_str::<InterruptFile>(&text).map_err(|e| e.to_string())
                    }) {
                    Ok(file) => {
                        let mut rules = self.shared.interrupt_rules.write().await;
                        let mut globals = self.shared.user_enabled_globals.write().await;
                        for mut rule in file.interrupts {
                            rule.plan_name = plan_name.clone();
                            if rule.scope == InterruptScope::Global && rule.enabled_by_default {
                                globals.insert(rule.name.clone());
                            }
                            rules.insert(rule.name.clone(), rule);
                        }
                    }
                    Err(err) => {
                        error!(path = %interrupts_path.display(), %err, "interrupt file unreadable")
                    }
                }
            }

            // Task definitions
            let definitions = orchestrator.task_definitions();
            let mut all = self.shared.task_definitions.write().await;
            for (task_id, def) in definitions {
                all.insert(format!("{plan_name}/{task_id}"), def);
            }
        }
    }

    /// Bridge task `triggers` to the event bus: matching events enqueue an
    /// event tasklet consumed by the event workers.
    async fn subscribe_event_triggers(&self) {
        let definitions = self.shared.task_definitions.read().await.clone();
        let plugin_ids = self.shared.plan_plugin_ids.read().await.clone();
        let mut subscribed = 0usize;

        for (fqid, def) in definitions {
            for trigger in &def.triggers {
                let plan = fqid.split('/').next().unwrap_or_default();
                let channel = trigger
                    .channel
                    .clone()
                    .or_else(|| plugin_ids.get(plan).cloned())
                    .unwrap_or_else(|| aura_core::event::CHANNEL_GLOBAL.to_string());

                let shared = Arc::clone(&self.shared);
                let fqid = fqid.clone();
                let callback = EventBus::callback(move |event: Event| {
                    let shared = Arc::clone(&shared);
                    let fqid = fqid.clone();
                    async move {
                        info!(event = %event.name, task = %fqid, "event triggered task");
                        shared
                            .event_task_queue
                            .put(Tasklet::new(fqid).with_event(event))
                            .await
                            .map_err(|err| anyhow::anyhow!(err))
                    }
                });
                if let Err(err) = self
                    .env
                    .bus
                    .subscribe(&channel, &trigger.event, callback)
                    .await
                {
                    error!(%err, "event trigger subscription failed");
                } else {
                    subscribed += 1;
                }
            }
        }
        info!(count = subscribed, "event triggers subscribed");
    }

    // --- lifecycle --------------------------------------------------------

    /// Start the background services.
    pub async fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler is already running");
            return;
        }
        info!("starting scheduler and background services");

        let mut handles = self.service_handles.lock().await;
        handles.push(tokio::spawn(
            SchedulingService::new(Arc::clone(&self.shared)).run(),
        ));
        handles.push(tokio::spawn(
            InterruptService::new(Arc::clone(&self.shared)).run(),
        ));
        handles.push(tokio::spawn(
            Arc::new(Commander::new(
                Arc::clone(&self.shared),
                Arc::clone(&self.manager),
            ))
            .run(),
        ));
        for worker_id in 0..EVENT_WORKERS {
            handles.push(tokio::spawn(event_worker_loop(
                worker_id,
                Arc::clone(&self.shared),
                Arc::clone(&self.manager),
            )));
        }
    }

    /// Stop the background services.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            warn!("scheduler is already stopped");
            return;
        }
        info!("stopping scheduler");
        let mut handles = self.service_handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    // --- discovery --------------------------------------------------------

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            plans: self.shared.plans.read().await.len(),
            tasks: self.shared.task_definitions.read().await.len(),
            actions: self.env.actions.len(),
            services: self.env.services.list().len(),
            queued_tasklets: self.shared.task_queue.len(),
            active_runs: self.shared.running_tasks.read().await.len(),
        }
    }

    pub async fn list_plans(&self) -> Vec<String> {
        let mut plans: Vec<String> = self.shared.plans.read().await.keys().cloned().collect();
        plans.sort();
        plans
    }

    pub async fn list_tasks(&self, plan: &str) -> Result<Vec<String>, FacadeError> {
        if !self.shared.plans.read().await.contains_key(plan) {
            return Err(FacadeError::PlanNotFound(plan.to_string()));
        }
        let prefix = format!("{plan}/");
        let mut tasks: Vec<String> = self
            .shared
            .task_definitions
            .read()
            .await
            .keys()
            .filter_map(|fqid| fqid.strip_prefix(&prefix).map(str::to_string))
            .collect();
        tasks.sort();
        Ok(tasks)
    }

    pub fn list_actions(&self) -> Vec<ActionInfo> {
        self.env
            .actions
            .list()
            .into_iter()
            .map(|def| ActionInfo {
                name: def.name.clone(),
                fqid: def.fqid.clone(),
                read_only: def.read_only,
                public: def.public,
            })
            .collect()
    }

    pub fn list_services(&self) -> Vec<ServiceInfo> {
        self.env.services.list()
    }

    // --- execution --------------------------------------------------------

    /// Queue an ad-hoc run of `plan/task`.
    pub async fn run_ad_hoc(
        &self,
        plan: &str,
        task: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<(), FacadeError> {
        let tasklet = self.ad_hoc_tasklet(plan, task, params).await?;
        self.shared.task_queue.put(tasklet).await?;
        info!(task = %format!("{plan}/{task}"), "ad-hoc task queued");
        Ok(())
    }

    /// Run `plan/task` to completion, bypassing the queue. Used by the CLI
    /// and tests that need the outcome.
    pub async fn run_task_blocking(
        &self,
        plan: &str,
        task: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<TaskRunResult, FacadeError> {
        let tasklet = self.ad_hoc_tasklet(plan, task, params).await?;
        Ok(self.manager.submit(tasklet, false).await?)
    }

    async fn ad_hoc_tasklet(
        &self,
        plan: &str,
        task: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<Tasklet, FacadeError> {
        if !self.shared.plans.read().await.contains_key(plan) {
            return Err(FacadeError::PlanNotFound(plan.to_string()));
        }
        let fqid = format!("{plan}/{task}");
        let definitions = self.shared.task_definitions.read().await;
        let def = definitions
            .get(&fqid)
            .ok_or_else(|| FacadeError::TaskNotFound(fqid.clone()))?;

        let mut payload = json!({"plan_name": plan, "task_name": task});
        if let Some(params) = params {
            payload["params"] = Value::Object(params);
        }
        let mut tasklet = Tasklet::new(fqid)
            .ad_hoc()
            .with_payload(payload)
            .with_execution_mode(def.execution_mode)
            .with_resource_tags(def.resource_tags.clone());
        if let Some(timeout) = def.timeout_sec {
            tasklet = tasklet.with_timeout(Duration::from_secs(timeout));
        }
        Ok(tasklet)
    }

    /// Manually trigger a schedule item at high priority.
    pub async fn run_manual(&self, schedule_id: &str) -> Result<(), FacadeError> {
        {
            let statuses = self.shared.run_statuses.read().await;
            if let Some(record) = statuses.get(schedule_id) {
                if record.state != crate::state::RunState::Idle {
                    return Err(FacadeError::AlreadyQueued(schedule_id.to_string()));
                }
            }
        }
        let item = {
            let items = self.shared.schedule_items.read().await;
            items
                .iter()
                .find(|item| item.id == schedule_id)
                .cloned()
                .ok_or_else(|| FacadeError::ScheduleItemNotFound(schedule_id.to_string()))?
        };

        let tasklet = Tasklet::new(item.task_fqid())
            .with_payload(serde_json::to_value(&item).unwrap_or_default())
            .with_priority(aura_core::Priority::High);
        self.shared.task_queue.put(tasklet).await?;
        self.shared
            .update_run_status(schedule_id, |record| record.mark_queued(Utc::now()))
            .await;
        info!(item = %item.display_name(), "manual run queued at high priority");
        Ok(())
    }

    // --- observation ------------------------------------------------------

    /// Every schedule item merged with its run record.
    pub async fn get_schedule_status(&self) -> Vec<Value> {
        let items = self.shared.schedule_items.read().await.clone();
        let statuses = self.shared.run_statuses.read().await;
        items
            .into_iter()
            .map(|item| {
                let record = statuses.get(&item.id).cloned().unwrap_or_default();
                let mut merged = serde_json::to_value(&item).unwrap_or_default();
                if let Some(map) = merged.as_object_mut() {
                    map.insert("plan_name".into(), json!(item.plan_name));
                    map.insert(
                        "status".into(),
                        serde_json::to_value(&record).unwrap_or_default(),
                    );
                }
                merged
            })
            .collect()
    }

    pub async fn get_active_runs(&self) -> Vec<ActiveRun> {
        self.shared
            .running_tasks
            .read()
            .await
            .values()
            .map(|handle| ActiveRun {
                task_fqid: handle.tasklet.task_fqid.clone(),
                started_at: handle.started_at,
                is_interrupt_handler: handle.is_interrupt_handler,
            })
            .collect()
    }

    pub async fn get_queue_overview(&self) -> QueueOverview {
        QueueOverview {
            task_queue: self.shared.task_queue.len(),
            event_task_queue: self.shared.event_task_queue.len(),
            interrupt_queue: self.shared.interrupt_queue.lock().await.len(),
            active_runs: self.shared.running_tasks.read().await.len(),
        }
    }

    pub async fn get_run_timeline(&self, schedule_id: &str) -> Option<Vec<TimelineEntry>> {
        self.shared
            .run_statuses
            .read()
            .await
            .get(schedule_id)
            .map(|record| record.timeline.clone())
    }

    pub async fn get_run_record(&self, schedule_id: &str) -> Option<RunRecord> {
        self.shared.run_statuses.read().await.get(schedule_id).cloned()
    }

    // --- schedule mutation ------------------------------------------------

    /// Add a schedule item; a missing id is generated. Persists the plan's
    /// schedule file.
    pub async fn add_schedule_item(&self, mut item: ScheduleItem) -> Result<String, FacadeError> {
        if item.plan_name.is_empty() {
            return Err(FacadeError::PlanNotFound(String::new()));
        }
        if !self.shared.plans.read().await.contains_key(&item.plan_name) {
            return Err(FacadeError::PlanNotFound(item.plan_name));
        }
        if item.id.is_empty() {
            item.id = Uuid::new_v4().to_string();
        }
        let id = item.id.clone();
        let plan = item.plan_name.clone();
        {
            let mut items = self.shared.schedule_items.write().await;
            items.push(item);
        }
        self.shared
            .update_run_status(&id, |_record| {})
            .await;
        self.save_schedule_for_plan(&plan).await?;
        info!(id = %id, plan = %plan, "schedule item added");
        Ok(id)
    }

    /// Replace a schedule item by id and persist.
    pub async fn update_schedule_item(&self, updated: ScheduleItem) -> Result<(), FacadeError> {
        let plan = {
            let mut items = self.shared.schedule_items.write().await;
            let slot = items
                .iter_mut()
                .find(|item| item.id == updated.id)
                .ok_or_else(|| FacadeError::ScheduleItemNotFound(updated.id.clone()))?;
            let plan = slot.plan_name.clone();
            *slot = ScheduleItem {
                plan_name: plan.clone(),
                ..updated
            };
            plan
        };
        self.save_schedule_for_plan(&plan).await?;
        Ok(())
    }

    /// Remove a schedule item by id and persist.
    pub async fn delete_schedule_item(&self, schedule_id: &str) -> Result<(), FacadeError> {
        let plan = {
            let mut items = self.shared.schedule_items.write().await;
            let index = items
                .iter()
                .position(|item| item.id == schedule_id)
                .ok_or_else(|| FacadeError::ScheduleItemNotFound(schedule_id.to_string()))?;
            let removed = items.remove(index);
            removed.plan_name
        };
        self.shared.run_statuses.write().await.remove(schedule_id);
        self.save_schedule_for_plan(&plan).await?;
        info!(id = schedule_id, "schedule item deleted");
        Ok(())
    }

    /// Flip an item's enabled flag and persist.
    pub async fn toggle_task_enabled(
        &self,
        schedule_id: &str,
        enabled: bool,
    ) -> Result<(), FacadeError> {
        let plan = {
            let mut items = self.shared.schedule_items.write().await;
            let item = items
                .iter_mut()
                .find(|item| item.id == schedule_id)
                .ok_or_else(|| FacadeError::ScheduleItemNotFound(schedule_id.to_string()))?;
            item.enabled = enabled;
            item.plan_name.clone()
        };
        self.save_schedule_for_plan(&plan).await?;
        info!(id = schedule_id, enabled, "schedule item toggled");
        Ok(())
    }

    /// Write a plan's schedule items back in their file form.
    async fn save_schedule_for_plan(&self, plan: &str) -> Result<(), FacadeError> {
        let items: Vec<ScheduleItem> = self
            .shared
            .schedule_items
            .read()
            .await
            .iter()
            .filter(|item| item.plan_name == plan)
            .cloned()
            .collect();
        let path = self.base_path.join("plans").join(plan).join("schedule.yaml");
        let text = serde_yaml::to_string(&items).map_err(|err| FacadeError::SaveFailed {
            path: path.display().to_string(),
            detail: err.to_string(),
        })?;
        tokio::fs::write(&path, text)
            .await
            .map_err(|err| FacadeError::SaveFailed {
                path: path.display().to_string(),
                detail: err.to_string(),
            })?;
        info!(path = %path.display(), "schedule file updated");
        Ok(())
    }

    // --- interrupts -------------------------------------------------------

    pub async fn enable_global_interrupt(&self, name: &str) {
        let rules = self.shared.interrupt_rules.read().await;
        if matches!(rules.get(name), Some(rule) if rule.scope == InterruptScope::Global) {
            self.shared
                .user_enabled_globals
                .write()
                .await
                .insert(name.to_string());
            info!(rule = name, "global interrupt enabled");
        }
    }

    pub async fn disable_global_interrupt(&self, name: &str) {
        self.shared.user_enabled_globals.write().await.remove(name);
        info!(rule = name, "global interrupt disabled");
    }

    pub async fn get_interrupt_rules(&self) -> Vec<InterruptRule> {
        let mut rules: Vec<InterruptRule> = self
            .shared
            .interrupt_rules
            .read()
            .await
            .values()
            .cloned()
            .collect();
        rules.sort_by(|a, b| (a.plan_name.clone(), a.name.clone()).cmp(&(b.plan_name.clone(), b.name.clone())));
        rules
    }

    // --- events -----------------------------------------------------------

    /// Publish an event on behalf of an external caller.
    pub async fn publish_event(
        &self,
        name: &str,
        payload: Value,
        source: Option<&str>,
        channel: &str,
    ) -> usize {
        let mut event = Event::with_channel(name, payload, channel);
        if let Some(source) = source {
            event = event.from_source(source);
        }
        self.env.bus.publish(event).await
    }

    /// Stream of all delivered events for external consumers.
    pub fn event_stream(&self) -> broadcast::Receiver<Event> {
        self.env.bus.event_stream()
    }

    // --- state planner ----------------------------------------------------

    /// Drive a plan into a target state. Failures surface as `false`.
    pub async fn ensure_state(&self, plan: &str, target: &str) -> Result<bool, FacadeError> {
        let orchestrator = self
            .shared
            .plans
            .read()
            .await
            .get(plan)
            .cloned()
            .ok_or_else(|| FacadeError::PlanNotFound(plan.to_string()))?;
        Ok(orchestrator.ensure_state(target).await)
    }

    // --- persistent context ----------------------------------------------

    pub async fn get_persistent_context(
        &self,
        plan: &str,
    ) -> Result<std::collections::BTreeMap<String, Value>, FacadeError> {
        let orchestrator = self
            .shared
            .plans
            .read()
            .await
            .get(plan)
            .cloned()
            .ok_or_else(|| FacadeError::PlanNotFound(plan.to_string()))?;
        Ok(orchestrator.persistent_data().await)
    }

    pub async fn save_persistent_context(
        &self,
        plan: &str,
        data: std::collections::BTreeMap<String, Value>,
    ) -> Result<(), FacadeError> {
        let orchestrator = self
            .shared
            .plans
            .read()
            .await
            .get(plan)
            .cloned()
            .ok_or_else(|| FacadeError::PlanNotFound(plan.to_string()))?;
        orchestrator
            .save_persistent_data(data)
            .await
            .map_err(|err| FacadeError::SaveFailed {
                path: plan.to_string(),
                detail: err.to_string(),
            })
    }

    /// Shared state handle for embedded integrations and tests.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.manager
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }
}

/// Event workers drain the event-task queue into the execution manager.
async fn event_worker_loop(
    worker_id: usize,
    shared: Arc<SharedState>,
    manager: Arc<ExecutionManager>,
) {
    info!(worker_id, "event worker started");
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let tasklet = tokio::select! {
            got = shared.event_task_queue.get() => match got {
                Ok(tasklet) => tasklet,
                Err(_) => break,
            },
            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
        };
        info!(worker_id, task = %tasklet.task_fqid, "executing event-triggered task");
        if let Err(err) = manager.submit(tasklet, false).await {
            error!(worker_id, %err, "event task submission failed");
        }
    }
    info!(worker_id, "event worker stopped");
}
