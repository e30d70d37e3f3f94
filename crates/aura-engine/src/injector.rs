//! Action injector
//!
//! Resolves an action by name, renders its raw parameters against the run
//! context, assembles the final arguments, and invokes the handler. The
//! argument precedence for named parameters is: service dependencies by
//! alias, the reserved names (`context`, `persistent_context`, `engine` —
//! provided through the call itself), rendered parameters by name, a
//! context lookup by parameter name, the declared default, and finally a
//! missing-parameter error. Record-style actions take the whole rendered
//! map in one shot and validate on deserialization.
//!
//! Blocking handlers run on the blocking pool with the logical task scope
//! carried into the tracing span.

use std::collections::HashMap;
use std::sync::Arc;

use aura_core::Context;
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::actions::{ActionCall, ActionDefinition, ActionError, ActionHandler, ParamStyle};
use crate::env::RuntimeEnv;

/// Parameter names filled from the call itself, never from params
const RESERVED_PARAMS: [&str; 3] = ["context", "persistent_context", "engine"];

/// Stateless resolver bound to one run's context
pub struct ActionInjector {
    env: Arc<RuntimeEnv>,
    context: Context,
    task_fqid: String,
}

impl ActionInjector {
    pub fn new(env: Arc<RuntimeEnv>, context: Context, task_fqid: impl Into<String>) -> Self {
        Self {
            env,
            context,
            task_fqid: task_fqid.into(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Render every value in a raw parameter map.
    pub fn render_params(&self, raw_params: &Map<String, Value>) -> Map<String, Value> {
        let snapshot = self.context.snapshot();
        raw_params
            .iter()
            .map(|(k, v)| (k.clone(), self.env.renderer.render_value(v, &snapshot)))
            .collect()
    }

    /// Render a single value against the current context.
    pub fn render_value(&self, value: &Value) -> Value {
        self.env.renderer.render_value(value, &self.context.snapshot())
    }

    /// Render a condition and report truthiness.
    pub fn render_truthy(&self, value: &Value) -> bool {
        self.env
            .renderer
            .render_truthy(value, &self.context.snapshot())
    }

    /// Execute one action with raw (unrendered) params.
    pub async fn execute(
        &self,
        action_name: &str,
        raw_params: &Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let def = self
            .env
            .actions
            .get(action_name)
            .ok_or_else(|| ActionError::NotFound(action_name.to_string()))?;

        let rendered = self.render_params(raw_params);
        self.invoke(&def, rendered).await
    }

    /// Execute a definition with already-rendered params.
    pub async fn invoke(
        &self,
        def: &ActionDefinition,
        rendered: Map<String, Value>,
    ) -> Result<Value, ActionError> {
        let services = self.resolve_services(def)?;
        let args = self.assemble_args(def, rendered)?;

        let call = ActionCall {
            args,
            services,
            context: self.context.clone(),
            task_fqid: self.task_fqid.clone(),
        };

        match &def.handler {
            ActionHandler::Async(handler) => handler(call).await,
            ActionHandler::Blocking(handler) => {
                let handler = Arc::clone(handler);
                let span =
                    tracing::info_span!("blocking_action", action = %def.name, task = %self.task_fqid);
                tokio::task::spawn_blocking(move || {
                    let _guard = span.enter();
                    handler(call)
                })
                .instrument(tracing::Span::current())
                .await
                .map_err(|join_err| ActionError::Failed {
                    action: def.name.clone(),
                    detail: format!("blocking action panicked: {join_err}"),
                })?
            }
        }
    }

    fn resolve_services(
        &self,
        def: &ActionDefinition,
    ) -> Result<HashMap<String, Arc<dyn crate::service::Service>>, ActionError> {
        let mut services = HashMap::new();
        for (alias, service_id) in &def.service_deps {
            let instance =
                self.env
                    .services
                    .get(service_id)
                    .map_err(|err| ActionError::Failed {
                        action: def.name.clone(),
                        detail: format!("service dependency '{alias}' unavailable: {err}"),
                    })?;
            services.insert(alias.clone(), instance);
        }
        Ok(services)
    }

    fn assemble_args(
        &self,
        def: &ActionDefinition,
        rendered: Map<String, Value>,
    ) -> Result<Map<String, Value>, ActionError> {
        let specs = match &def.params {
            // Record style: the whole rendered map is the argument object
            ParamStyle::Record => return Ok(rendered),
            ParamStyle::Named(specs) => specs,
        };

        let mut args = Map::new();
        for spec in specs {
            if def.service_deps.contains_key(&spec.name)
                || RESERVED_PARAMS.contains(&spec.name.as_str())
            {
                continue;
            }
            if let Some(value) = rendered.get(&spec.name) {
                args.insert(spec.name.clone(), value.clone());
                continue;
            }
            if let Some(value) = self.context.get(&spec.name) {
                args.insert(spec.name.clone(), value);
                continue;
            }
            if let Some(default) = &spec.default {
                args.insert(spec.name.clone(), default.clone());
                continue;
            }
            if spec.required {
                return Err(ActionError::MissingParameter {
                    action: def.name.clone(),
                    param: spec.name.clone(),
                });
            }
        }
        Ok(args)
    }
}
