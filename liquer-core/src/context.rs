#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;

use crate::cache::{Cache, NoCache};
use crate::command_metadata::{CommandMetadata, CommandMetadataRegistry, DEFAULT_NAMESPACE};
use crate::commands::{
    parse_arguments, Command, CommandArguments, CommandRegistry, ExpandedActionParameter,
    ResolvedParameter,
};
use crate::dependencies::Dependencies;
use crate::error::{Error, ErrorType};
use crate::indexer::{Indexer, IndexerRegistry};
use crate::metadata::{
    timestamp, ArgumentQuery, ExtendedCommand, LogEntry, Metadata, ProgressIndicator, Status,
};
use crate::parse::parse_query;
use crate::query::{
    ActionParameter, ActionRequest, Position, Query, QuerySegment, ResourceQuerySegment,
    TransformQuerySegment,
};
use crate::recipes::RecipeRegistry;
use crate::state::State;
use crate::state_types::{StateType, StateTypesRegistry};
use crate::store::{NoStore, Store};
use crate::value::Value;

/// Number of entries kept in the child log
pub const CHILD_LOG_SIZE: usize = 5;

/// Default minimal interval between two metadata writes to the cache during an evaluation
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

fn read_lock<T: Clone>(lock: &RwLock<T>) -> T {
    match lock.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_lock<T>(lock: &RwLock<T>, value: T) {
    match lock.write() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

fn update_lock<T: Clone, R>(lock: &RwLock<Arc<T>>, f: impl FnOnce(&mut T) -> R) -> R {
    let mut guard = lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(Arc::make_mut(&mut guard))
}

/// Environment is the runtime shared by all evaluations:
/// command registry, state types, indexers, recipe kinds, cache and store.
///
/// Registries are kept as snapshots - readers get an `Arc` and never hold a lock
/// while evaluating; registration replaces the snapshot.
pub struct Environment {
    command_registry: RwLock<Arc<CommandRegistry>>,
    state_types: RwLock<Arc<StateTypesRegistry>>,
    indexers: RwLock<Arc<IndexerRegistry>>,
    recipe_registry: RwLock<Arc<RecipeRegistry>>,
    cache: RwLock<Arc<dyn Cache>>,
    store: RwLock<Arc<dyn Store>>,
    flush_interval_ms: AtomicU64,
    remote_registration: AtomicBool,
}

impl Environment {
    /// Environment with built-in state types, no cache and no store
    pub fn new() -> Arc<Environment> {
        Arc::new(Self::new_unshared())
    }

    fn new_unshared() -> Environment {
        Environment {
            command_registry: RwLock::new(Arc::new(CommandRegistry::new())),
            state_types: RwLock::new(Arc::new(StateTypesRegistry::new())),
            indexers: RwLock::new(Arc::new(IndexerRegistry::with_defaults())),
            recipe_registry: RwLock::new(Arc::new(RecipeRegistry::new())),
            cache: RwLock::new(Arc::new(NoCache::new())),
            store: RwLock::new(Arc::new(NoStore)),
            flush_interval_ms: AtomicU64::new(DEFAULT_FLUSH_INTERVAL.as_millis() as u64),
            remote_registration: AtomicBool::new(false),
        }
    }

    /// Sibling environment sharing the current registries and store, with its own cache
    pub fn fork_with_cache(&self, cache: Arc<dyn Cache>) -> Arc<Environment> {
        Arc::new(Environment {
            command_registry: RwLock::new(self.get_command_registry()),
            state_types: RwLock::new(self.get_state_types()),
            indexers: RwLock::new(self.get_indexers()),
            recipe_registry: RwLock::new(self.get_recipe_registry()),
            cache: RwLock::new(cache),
            store: RwLock::new(self.get_store()),
            flush_interval_ms: AtomicU64::new(self.flush_interval_ms.load(Ordering::Relaxed)),
            remote_registration: AtomicBool::new(self.is_remote_registration_enabled()),
        })
    }

    pub fn get_cache(&self) -> Arc<dyn Cache> {
        read_lock(&self.cache)
    }

    pub fn with_cache(&self, cache: Arc<dyn Cache>) -> &Self {
        write_lock(&self.cache, cache);
        self
    }

    pub fn get_store(&self) -> Arc<dyn Store> {
        read_lock(&self.store)
    }

    pub fn with_store(&self, store: Arc<dyn Store>) -> &Self {
        write_lock(&self.store, store);
        self
    }

    pub fn get_state_types(&self) -> Arc<StateTypesRegistry> {
        read_lock(&self.state_types)
    }

    pub fn register_state_type(&self, type_name: &str, state_type: Arc<dyn StateType>) -> &Self {
        update_lock(&self.state_types, |registry| {
            registry.register(type_name, state_type);
        });
        self
    }

    pub fn get_command_registry(&self) -> Arc<CommandRegistry> {
        read_lock(&self.command_registry)
    }

    pub fn get_command_metadata_registry(&self) -> CommandMetadataRegistry {
        self.get_command_registry().command_metadata_registry.clone()
    }

    /// Register a command, see [CommandRegistry::register]
    pub fn register_command<F>(&self, metadata: CommandMetadata, f: F) -> Result<&Self, Error>
    where
        F: Fn(&State, &CommandArguments, &mut Context<'_>) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        self.register_command_object(Command::new(metadata, f))
    }

    pub fn register_command_object(&self, command: Command) -> Result<&Self, Error> {
        update_lock(&self.command_registry, |registry| {
            registry.register_command(command).map(|_| ())
        })?;
        Ok(self)
    }

    pub fn get_indexers(&self) -> Arc<IndexerRegistry> {
        read_lock(&self.indexers)
    }

    pub fn register_indexer(&self, indexer: Arc<dyn Indexer>) -> &Self {
        update_lock(&self.indexers, |registry| {
            registry.register(indexer);
        });
        self
    }

    pub fn get_recipe_registry(&self) -> Arc<RecipeRegistry> {
        read_lock(&self.recipe_registry)
    }

    pub fn update_recipe_registry<R>(&self, f: impl FnOnce(&mut RecipeRegistry) -> R) -> R {
        update_lock(&self.recipe_registry, f)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_flush_interval(&self, interval: Duration) -> &Self {
        self.flush_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
        self
    }

    pub fn enable_remote_registration(&self) -> &Self {
        self.remote_registration.store(true, Ordering::Relaxed);
        self
    }

    pub fn disable_remote_registration(&self) -> &Self {
        self.remote_registration.store(false, Ordering::Relaxed);
        self
    }

    pub fn is_remote_registration_enabled(&self) -> bool {
        self.remote_registration.load(Ordering::Relaxed)
    }

    pub fn new_context(self: &Arc<Self>) -> Context<'static> {
        Context::new(self.clone())
    }

    /// Evaluate a query in a fresh context
    pub fn evaluate(self: &Arc<Self>, query: &str) -> Result<State, Error> {
        self.new_context().evaluate(query)
    }
}

static DEFAULT_ENVIRONMENT: OnceLock<Arc<Environment>> = OnceLock::new();

/// Process-wide environment used by the module-level shortcuts
pub fn default_environment() -> Arc<Environment> {
    DEFAULT_ENVIRONMENT.get_or_init(Environment::new).clone()
}

/// Evaluate a query in the default environment
pub fn evaluate(query: &str) -> Result<State, Error> {
    default_environment().evaluate(query)
}

/// Receiver of log entries and progress reported by child contexts
pub trait ChildSink {
    fn child_log_entry(&mut self, entry: LogEntry);
    fn child_progress(&mut self, indicator: ProgressIndicator);
}

/// Context controls a single evaluation. It is passed to commands, which use it to
/// log, report progress, set metadata and evaluate other queries.
///
/// Nested evaluations (link parameters, queries evaluated by commands) run in child contexts.
/// A child forwards its log entries and progress to the parent, tagged with its query.
pub struct Context<'a> {
    envref: Arc<Environment>,
    parent: Option<&'a mut (dyn ChildSink + 'a)>,
    metadata: Metadata,
    raw_query: String,
    query: Option<Query>,
    parent_query: Option<Query>,
    evaluating: bool,
    modified_vars: BTreeSet<String>,
    last_flush: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    next_progress_id: usize,
}

impl Context<'static> {
    pub fn new(envref: Arc<Environment>) -> Context<'static> {
        Context {
            envref,
            parent: None,
            metadata: Metadata::new(),
            raw_query: String::new(),
            query: None,
            parent_query: None,
            evaluating: false,
            modified_vars: BTreeSet::new(),
            last_flush: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            next_progress_id: 1,
        }
    }
}

impl<'a> Context<'a> {
    /// Use a shared cancellation flag
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// Child context reporting to this one
    pub fn child(&mut self) -> Context<'_> {
        let envref = self.envref.clone();
        let cancelled = self.cancelled.clone();
        Context {
            envref,
            parent: Some(self),
            metadata: Metadata::new(),
            raw_query: String::new(),
            query: None,
            parent_query: None,
            evaluating: false,
            modified_vars: BTreeSet::new(),
            last_flush: None,
            cancelled,
            next_progress_id: 1,
        }
    }

    pub fn envref(&self) -> &Arc<Environment> {
        &self.envref
    }

    pub fn get_store(&self) -> Arc<dyn Store> {
        self.envref.get_store()
    }

    pub fn get_cache(&self) -> Arc<dyn Cache> {
        self.envref.get_cache()
    }

    pub fn get_metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    pub fn query(&self) -> Option<&Query> {
        self.query.as_ref()
    }

    pub fn parent_query(&self) -> Option<&Query> {
        self.parent_query.as_ref()
    }

    pub fn is_evaluating(&self) -> bool {
        self.evaluating
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns an error when the evaluation has been cancelled
    pub fn check_cancelled(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::execution_error("Evaluation cancelled".to_owned())
                .with_query_text(&self.raw_query))
        } else {
            Ok(())
        }
    }

    pub fn log_entry(&mut self, entry: LogEntry) {
        let entry = if entry.query.is_none() && !self.raw_query.is_empty() {
            entry.with_query(&self.raw_query)
        } else {
            entry
        };
        let is_error = entry.is_error();
        tracing::debug!(query = %self.raw_query, kind = ?entry.kind, "{}", entry.message);
        self.metadata.log_entry(entry.clone());
        if let Some(parent) = self.parent.as_mut() {
            parent.child_log_entry(entry.with_origin(&self.raw_query));
        }
        self.flush(is_error);
    }

    pub fn debug(&mut self, message: &str) {
        self.log_entry(LogEntry::debug(message.to_owned()));
    }

    pub fn info(&mut self, message: &str) {
        self.log_entry(LogEntry::info(message.to_owned()));
    }

    pub fn warning(&mut self, message: &str) {
        self.log_entry(LogEntry::warning(message.to_owned()));
    }

    pub fn error(&mut self, message: &str) {
        self.log_entry(LogEntry::error(message.to_owned()));
    }

    /// Record an error on the state being produced
    fn record_error(&mut self, error: Error) {
        let error = if error.query.is_none() && !self.raw_query.is_empty() {
            error.with_query_text(&self.raw_query)
        } else {
            error
        };
        tracing::debug!(query = %self.raw_query, error = %error, "evaluation error");
        self.metadata.with_error(&error);
        if let (Some(entry), Some(parent)) = (self.metadata.log.last(), self.parent.as_mut()) {
            parent.child_log_entry(entry.clone().with_origin(&self.raw_query));
        }
        self.flush(true);
    }

    /// Allocate an id for an additional progress indicator
    pub fn new_progress_id(&mut self) -> usize {
        let id = self.next_progress_id;
        self.next_progress_id += 1;
        id
    }

    /// Report progress of the main indicator (id 0)
    pub fn progress(&mut self, step: usize, total: Option<usize>, message: &str) -> Result<(), Error> {
        self.progress_with_id(0, step, total, message)
    }

    /// Report progress; an indicator with the same id is replaced
    pub fn progress_with_id(
        &mut self,
        id: usize,
        step: usize,
        total: Option<usize>,
        message: &str,
    ) -> Result<(), Error> {
        let indicator = ProgressIndicator::new(id, step, total, message);
        self.metadata.progress_indicators.retain(|p| p.id != id);
        self.metadata.progress_indicators.push(indicator.clone());
        if let Some(parent) = self.parent.as_mut() {
            let mut forwarded = indicator;
            forwarded.origin = Some(self.raw_query.clone());
            parent.child_progress(forwarded);
        }
        self.flush(false);
        self.check_cancelled()
    }

    /// Call `f` for every item, reporting `i/n` progress.
    /// Stops with an error when the evaluation is cancelled.
    pub fn progress_iter<I, R, F>(&mut self, message: &str, items: I, mut f: F) -> Result<Vec<R>, Error>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
        F: FnMut(&mut Self, I::Item) -> Result<R, Error>,
    {
        let items = items.into_iter();
        let total = items.len();
        let id = self.new_progress_id();
        let mut result = Vec::with_capacity(total);
        for (i, item) in items.enumerate() {
            self.progress_with_id(id, i, Some(total), message)?;
            result.push(f(self, item)?);
        }
        self.progress_with_id(id, total, Some(total), message)?;
        Ok(result)
    }

    /// Write the metadata to the cache, at most once per flush interval unless forced
    fn flush(&mut self, force: bool) {
        if !self.evaluating || self.metadata.query.is_none() {
            return;
        }
        let due = force
            || self
                .last_flush
                .map_or(true, |t| t.elapsed() >= self.envref.flush_interval());
        if !due {
            return;
        }
        self.last_flush = Some(Instant::now());
        if let Err(e) = self.envref.get_cache().store_metadata(&self.metadata) {
            tracing::warn!(query = %self.raw_query, error = %e, "metadata flush failed");
        }
    }

    pub fn set_html_preview(&mut self, html: &str) {
        self.metadata.html_preview = html.to_owned();
    }

    pub fn set_title(&mut self, title: &str) {
        self.metadata.title = title.to_owned();
    }

    pub fn set_description(&mut self, description: &str) {
        self.metadata.description = description.to_owned();
    }

    pub fn set_filename(&mut self, filename: &str) {
        self.metadata.with_filename(filename);
    }

    /// Explicit type identifier of the produced state
    pub fn set_type_identifier(&mut self, type_identifier: &str) {
        self.metadata.with_type_identifier(type_identifier);
    }

    pub fn set_attribute<V: Into<JsonValue>>(&mut self, name: &str, value: V) {
        self.metadata.with_attribute(name, value);
    }

    /// Mark the produced state as volatile, it will not be cached
    pub fn set_volatile(&mut self) {
        self.metadata.volatile = true;
    }

    pub fn set_var<V: Into<JsonValue>>(&mut self, name: &str, value: V) {
        self.metadata.vars.insert(name.to_owned(), value.into());
        self.modified_vars.insert(name.to_owned());
    }

    pub fn get_var(&self, name: &str) -> Option<&JsonValue> {
        self.metadata.vars.get(name)
    }

    /// Variables modified by the current action
    pub fn modified_vars(&self) -> Vec<String> {
        self.modified_vars.iter().cloned().collect()
    }

    /// Active namespaces: set by the `ns` action, `root` always last
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = match self.metadata.vars.get("ns") {
            Some(JsonValue::Array(a)) => a
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_owned()))
                .collect(),
            _ => Vec::new(),
        };
        if !namespaces.iter().any(|n| n == DEFAULT_NAMESPACE) {
            namespaces.push(DEFAULT_NAMESPACE.to_owned());
        }
        namespaces
    }

    /// Expand `$query$` placeholders in a template
    pub fn evaluate_template(&mut self, template: &str) -> Result<String, Error> {
        crate::template::expand_template(self, template)
    }

    /// Evaluate a query.
    /// Errors of the evaluation are recorded in the returned state;
    /// only a version collision of cached dependencies is returned as an error.
    /// Called while an evaluation is running (e.g. from a command), the query
    /// is evaluated in a child context and recorded as a direct subquery.
    pub fn evaluate(&mut self, query: &str) -> Result<State, Error> {
        if self.evaluating {
            self.metadata.direct_subqueries.push(query.to_owned());
            let mut child = self.child();
            return child.evaluate(query);
        }
        match parse_query(query) {
            Ok(q) => self.evaluate_query(&q),
            Err(e) => {
                self.raw_query = query.to_owned();
                self.metadata = Metadata::new();
                self.metadata.with_query(query);
                self.record_error(e.with_query_text(query));
                Ok(State {
                    data: Arc::new(Value::None),
                    metadata: self.metadata.clone(),
                })
            }
        }
    }

    /// Evaluate a query relative to the parent query of the current action
    pub fn apply(&mut self, query: &str) -> Result<State, Error> {
        let query = parse_query(query)?;
        let resolved = self.resolve_relative(&query);
        if self.evaluating {
            self.metadata.direct_subqueries.push(resolved.encode());
            let mut child = self.child();
            return child.evaluate_query(&resolved);
        }
        self.evaluate_query(&resolved)
    }

    fn resolve_relative(&self, query: &Query) -> Query {
        match &self.parent_query {
            Some(parent) if !query.absolute && !parent.is_empty() => parent.append(query),
            _ => query.clone(),
        }
    }

    /// Evaluate a parsed query
    pub fn evaluate_query(&mut self, query: &Query) -> Result<State, Error> {
        if self.evaluating {
            let mut child = self.child();
            return child.evaluate_query(query);
        }
        self.evaluating = true;
        self.raw_query = query.encode();
        self.query = Some(query.clone());
        let result = self.evaluate_chain(query);
        self.evaluating = false;
        result
    }

    /// Iterative evaluation along the predecessor chain.
    /// The longest cached prefix is the starting point, the remaining steps are applied in order.
    fn evaluate_chain(&mut self, query: &Query) -> Result<State, Error> {
        let mut chain: Vec<(Query, Option<QuerySegment>)> = Vec::new();
        let mut current = query.clone();
        loop {
            let (p, r) = current.predecessor();
            chain.push((current, r));
            match p {
                Some(p) if !p.is_empty() => current = p,
                _ => break,
            }
        }
        if let Some((base, remainder)) = chain.last_mut() {
            if remainder.is_none() {
                if let Some(rqs) = base.resource_query() {
                    *remainder = Some(QuerySegment::Resource(rqs));
                }
            }
        }

        let mut state = State::new();
        let mut start = chain.len();
        if let Some((i, cached)) = self.cache_lookup(&chain)? {
            if i == 0 {
                return Ok(cached);
            }
            state = cached;
            start = i;
        }

        for j in (0..start).rev() {
            let (step_query, remainder) = &chain[j];
            let remainder = match remainder {
                Some(r) => r,
                None => continue,
            };
            let parent = chain.get(j + 1).map(|(q, _)| q);
            state = self.apply_step(&state, step_query, parent, remainder)?;
            if state.is_error() && j > 0 {
                return Ok(self.predecessor_failed(state, query));
            }
        }
        if state.query() != Some(query.encode().as_str()) {
            state.metadata.with_query(&query.encode());
        }
        Ok(state)
    }

    fn cache_lookup(
        &mut self,
        chain: &[(Query, Option<QuerySegment>)],
    ) -> Result<Option<(usize, State)>, Error> {
        let cache = self.envref.get_cache();
        for (i, (q, _)) in chain.iter().enumerate() {
            let key = q.encode();
            if !cache.contains(&key) {
                continue;
            }
            if let Some(state) = cache.get(&key) {
                if !state.metadata.status.has_data() {
                    continue;
                }
                self.check_dependencies(&state.metadata.dependencies)?;
                tracing::debug!(query = %key, "cache hit");
                return Ok(Some((i, state)));
            }
        }
        Ok(None)
    }

    /// Error state of the whole query when one of its predecessors failed
    fn predecessor_failed(&mut self, failed: State, query: &Query) -> State {
        let encoded = query.encode();
        let mut metadata = failed.metadata.clone();
        metadata.with_query(&encoded);
        if let Err(e) = self.envref.get_cache().store_metadata(&metadata) {
            tracing::warn!(query = %encoded, error = %e, "cache store failed");
        }
        self.metadata = metadata.clone();
        State {
            data: failed.data,
            metadata,
        }
    }

    fn begin_step(&mut self, input: &State, query: &Query, parent: Option<&Query>) {
        let encoded = query.encode();
        let mut metadata = Metadata::new();
        metadata.dependencies = input.metadata.dependencies.clone();
        metadata.with_query(&encoded);
        metadata.commands = input.metadata.commands.clone();
        metadata.extended_commands = input.metadata.extended_commands.clone();
        metadata.attributes = input.metadata.attributes.clone();
        metadata.retain_persistent_attributes();
        metadata.vars = input.metadata.vars.clone();
        metadata.resource_metadata = input.metadata.resource_metadata.clone();
        metadata.volatile = input.metadata.volatile;
        metadata.parent_query = parent.map(|p| p.encode());
        metadata.started = Some(timestamp());
        metadata.set_status(Status::Evaluation);
        self.metadata = metadata;
        self.raw_query = encoded;
        self.query = Some(query.clone());
        self.parent_query = parent.cloned();
        self.modified_vars.clear();
        self.last_flush = None;
    }

    fn apply_step(
        &mut self,
        input: &State,
        query: &Query,
        parent: Option<&Query>,
        remainder: &QuerySegment,
    ) -> Result<State, Error> {
        self.begin_step(input, query, parent);
        let (result, cacheable) = match remainder {
            QuerySegment::Resource(rqs) => (self.load_resource(rqs), false),
            QuerySegment::Transform(tqs) => (self.apply_transform(input, tqs), true),
        };
        let data = match result {
            Ok(data) => data,
            Err(e) if e.error_type == ErrorType::VersionCollision => return Err(e),
            Err(e) => {
                self.record_error(e);
                Arc::new(Value::None)
            }
        };
        Ok(self.finish_step(data, cacheable))
    }

    fn apply_transform(
        &mut self,
        input: &State,
        tqs: &TransformQuerySegment,
    ) -> Result<Arc<Value>, Error> {
        let mut current = input.clone();
        for action in tqs.query.iter() {
            let value = self.apply_action(&current, action)?;
            current = current.with_data(value);
        }
        if let Some(filename) = &tqs.filename {
            if tqs.query.is_empty() {
                self.metadata.type_identifier = input.metadata.type_identifier.clone();
                self.metadata.title = input.metadata.title.clone();
                self.metadata.description = input.metadata.description.clone();
            }
            self.metadata.with_filename(&filename.name);
        }
        Ok(current.data)
    }

    fn apply_action(&mut self, input: &State, action: &ActionRequest) -> Result<Value, Error> {
        if let Some(parameters) = action.ns() {
            let mut namespaces: Vec<JsonValue> = parameters
                .iter()
                .filter_map(|p| p.string_value())
                .map(JsonValue::String)
                .collect();
            if !namespaces.iter().any(|n| n.as_str() == Some(DEFAULT_NAMESPACE)) {
                namespaces.push(JsonValue::String(DEFAULT_NAMESPACE.to_owned()));
            }
            self.set_var("ns", JsonValue::Array(namespaces));
            self.metadata.type_identifier = input.metadata.type_identifier.clone();
            return Ok((*input.data).clone());
        }

        let mut record = vec![action.name.clone()];
        record.extend(action.parameters.iter().map(|p| p.encode()));
        self.metadata.commands.push(record);
        self.log_entry(LogEntry::command(action.encode()).with_position(&action.position));

        let namespaces = self.namespaces();
        let command = self
            .envref
            .get_command_registry()
            .resolve(&namespaces, &action.name)
            .ok_or_else(|| Error::action_not_registered(action, &namespaces))?;

        let mut parameters = Vec::with_capacity(action.parameters.len());
        for parameter in action.parameters.iter() {
            match parameter {
                ActionParameter::String(text, position) => {
                    parameters.push(ResolvedParameter::Text(text.clone(), position.clone()))
                }
                ActionParameter::Link(link, position) => {
                    let expanded = self.expand_link(link, position)?;
                    parameters.push(ResolvedParameter::Expanded(expanded));
                }
            }
        }
        let metadata = &command.metadata;
        let arguments = parse_arguments(metadata, &parameters, &action.position)?;
        self.metadata.extended_commands.push(ExtendedCommand {
            name: metadata.name.clone(),
            ns: metadata.namespace.clone(),
            action: action.encode(),
            position: action.position.clone(),
            arguments: arguments.to_json(),
            version: metadata.version.clone(),
        });
        self.metadata.dependencies.add_command_dependency(
            &metadata.namespace,
            &metadata.name,
            &metadata.version,
            true,
        )?;
        if metadata.volatile {
            self.metadata.volatile = true;
        }
        if !metadata.cache {
            self.metadata.caching = false;
        }
        for (name, value) in metadata.state_attributes() {
            self.metadata.attributes.insert(name.clone(), value.clone());
        }
        self.check_cancelled()?;

        let result = command.execute(input, &arguments, self);
        result.map_err(|e| {
            let e = if e.position.is_unknown() {
                e.with_position(&action.position)
            } else {
                e
            };
            e.with_frame(format!("action '{}' in '{}'", action.encode(), self.raw_query))
        })
    }

    /// Evaluate a link parameter; relative links are applied to the parent query
    fn expand_link(
        &mut self,
        link: &Query,
        position: &Position,
    ) -> Result<ExpandedActionParameter, Error> {
        let resolved = self.resolve_relative(link);
        let state = {
            let mut child = self.child();
            child.evaluate_query(&resolved)?
        };
        self.metadata.argument_queries.push(ArgumentQuery {
            query: link.encode(),
            resolved: resolved.encode(),
            position: position.clone(),
        });
        if state.is_error() {
            return Err(Error::general_error(format!(
                "Error evaluating link parameter '{}'",
                link.encode()
            ))
            .with_position(position)
            .with_cause(&state.metadata.message));
        }
        if state.is_volatile() {
            self.metadata.volatile = true;
        }
        self.metadata
            .dependencies
            .merge(&state.metadata.dependencies)?;
        Ok(ExpandedActionParameter {
            link: resolved,
            state,
            position: position.clone(),
        })
    }

    /// Load a resource from the store.
    /// `-R-meta/key` gives the metadata of the resource, a directory gives the list of names.
    fn load_resource(&mut self, rqs: &ResourceQuerySegment) -> Result<Arc<Value>, Error> {
        let store = self.envref.get_store();
        let key = &rqs.key;
        let is_meta = rqs.header.as_ref().map_or(false, |h| {
            h.name == "meta" || h.parameters.first().map_or(false, |p| p.value == "meta")
        });
        if is_meta {
            let metadata = store.get_metadata(key)?;
            let json = metadata.to_json_value()?;
            self.metadata.resource_metadata = Some(Box::new(metadata));
            return Ok(Arc::new(Value::from_json_value(&json)));
        }
        if store.is_dir(key)? {
            let names = store.listdir(key)?;
            self.metadata.resource_metadata = store.get_metadata(key).ok().map(Box::new);
            return Ok(Arc::new(Value::Array(
                names.into_iter().map(Value::Text).collect(),
            )));
        }
        let (bytes, metadata) = store.get(key)?;
        self.metadata.resource_metadata = Some(Box::new(metadata.clone()));
        if let Some(filename) = key.filename() {
            self.metadata.with_filename(&filename.name);
        }
        let state_types = self.envref.get_state_types();
        let value = match metadata.type_identifier.as_deref() {
            Some(t) if t != "bytes" && state_types.contains(t) => {
                match state_types.decode(&bytes, t, key.extension().as_deref()) {
                    Ok(value) => {
                        self.metadata.with_type_identifier(t);
                        value
                    }
                    Err(e) => {
                        self.warning(&format!("Resource {} kept as bytes: {}", key, e));
                        Value::Bytes(bytes)
                    }
                }
            }
            _ => Value::Bytes(bytes),
        };
        Ok(Arc::new(value))
    }

    fn finish_step(&mut self, data: Arc<Value>, cacheable: bool) -> State {
        let state_types = self.envref.get_state_types();
        let mut metadata = self.metadata.clone();
        if !metadata.is_error {
            let state_type = match metadata.type_identifier.as_deref() {
                Some(t) if state_types.contains(t) => state_types.get(t),
                _ => state_types.get_for_value(&data),
            };
            metadata.with_type_identifier(state_type.identifier());
            metadata.data_characteristics = Some(state_types.data_characteristics(&data));
            if state_type.is_volatile(&data) {
                metadata.volatile = true;
            }
            if metadata.mimetype.is_none() {
                metadata.mimetype = Some(state_type.default_mimetype());
            }
            metadata.set_status(Status::Ready);
        }
        let now = timestamp();
        metadata.created = Some(now.clone());
        metadata.updated = Some(now);
        let metadata =
            self.envref
                .get_indexers()
                .index(None, self.query.as_ref(), Some(&data), metadata);
        self.metadata = metadata.clone();
        let mut state = State { data, metadata };
        if cacheable {
            self.cache_state(&mut state);
        }
        state
    }

    /// Store a cacheable state; otherwise drop the previous entry and keep only metadata
    fn cache_state(&self, state: &mut State) {
        let cache = self.envref.get_cache();
        let state_types = self.envref.get_state_types();
        let metadata = &state.metadata;
        let query = metadata.query.clone().unwrap_or_default();
        let serializable = state_types
            .get(&metadata.type_identifier())
            .supports_serialization();
        if metadata.caching && !metadata.volatile && !metadata.is_error && serializable {
            if let Err(e) = cache.store(state) {
                tracing::warn!(query = %query, error = %e, "cache store failed");
            }
            return;
        }
        if !metadata.is_error {
            if let Err(e) = cache.remove(&query) {
                tracing::warn!(query = %query, error = %e, "cache remove failed");
                state.metadata.set_status(Status::Obsolete);
            }
        }
        if let Err(e) = cache.store_metadata(&state.metadata) {
            tracing::warn!(query = %query, error = %e, "cache metadata store failed");
        }
    }

    /// Verify that cached dependencies agree with the commands currently registered
    pub fn check_dependencies(&self, dependencies: &Dependencies) -> Result<(), Error> {
        let registry = self.envref.get_command_registry();
        let mut current = Dependencies::new().with_query(&dependencies.query);
        for key in dependencies.commands.keys() {
            if let Some((ns, name)) = key.strip_prefix("ns-").and_then(|k| k.split_once('/')) {
                if let Some(command) = registry.get(ns, name) {
                    current.add_command_dependency(ns, name, &command.metadata.version, false)?;
                }
            }
        }
        dependencies.check_compatible(&current)
    }

    /// Dependencies of a query, collected from the query and the registered commands
    pub fn dependencies(&self, query: &str) -> Result<Dependencies, Error> {
        let query = parse_query(query)?;
        let mut dependencies = Dependencies::new().with_query(&query.encode());
        self.collect_dependencies(&query, &mut dependencies)?;
        Ok(dependencies)
    }

    fn collect_dependencies(&self, query: &Query, dependencies: &mut Dependencies) -> Result<(), Error> {
        let registry = self.envref.get_command_registry();
        let mut namespaces = vec![DEFAULT_NAMESPACE.to_owned()];
        for segment in query.segments.iter() {
            if let QuerySegment::Transform(tqs) = segment {
                for action in tqs.query.iter() {
                    if let Some(ns) = action.ns() {
                        namespaces = ns.iter().filter_map(|p| p.string_value()).collect();
                        namespaces.push(DEFAULT_NAMESPACE.to_owned());
                        continue;
                    }
                    let command = registry
                        .resolve(&namespaces, &action.name)
                        .ok_or_else(|| Error::action_not_registered(action, &namespaces))?;
                    dependencies.add_command_dependency(
                        &command.metadata.namespace,
                        &command.metadata.name,
                        &command.metadata.version,
                        true,
                    )?;
                    for parameter in action.parameters.iter() {
                        if let ActionParameter::Link(link, _) = parameter {
                            self.collect_dependencies(link, dependencies)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl<'a> ChildSink for Context<'a> {
    fn child_log_entry(&mut self, entry: LogEntry) {
        self.metadata.child_log.push(entry.clone());
        let n = self.metadata.child_log.len();
        if n > CHILD_LOG_SIZE {
            self.metadata.child_log.drain(0..n - CHILD_LOG_SIZE);
        }
        if let Some(parent) = self.parent.as_mut() {
            parent.child_log_entry(entry);
        }
    }

    fn child_progress(&mut self, indicator: ProgressIndicator) {
        let origin = indicator.origin.clone();
        self.metadata
            .child_progress_indicators
            .retain(|p| p.origin != origin || p.id != indicator.id);
        self.metadata.child_progress_indicators.push(indicator.clone());
        if let Some(parent) = self.parent.as_mut() {
            parent.child_progress(indicator);
        }
        self.flush(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::command_metadata::ArgumentInfo;
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    fn environment() -> Result<Arc<Environment>, Error> {
        let env = Environment::new();
        let mut value = CommandMetadata::first("value");
        value.with_argument(ArgumentInfo::integer_argument("x"));
        env.register_command(value, |_, args, _| Ok(Value::I64(args.get(0, "x")?)))?;
        let mut add = CommandMetadata::new("add");
        add.with_argument(ArgumentInfo::integer_argument("y").with_default(1));
        env.register_command(add, |state, args, _| {
            Ok(Value::I64(state.get()?.try_into_i64()? + args.get::<i64>(0, "y")?))
        })?;
        Ok(env)
    }

    #[test]
    fn simple_chain() -> Result<(), Error> {
        let env = environment()?;
        let state = env.evaluate("value-1/add-2/add")?;
        assert_eq!(*state.get()?, Value::I64(4));
        assert_eq!(state.query(), Some("value-1/add-2/add"));
        assert_eq!(state.status(), Status::Ready);
        assert_eq!(state.metadata.commands.len(), 3);
        assert_eq!(state.metadata.commands[1], vec!["add".to_owned(), "2".to_owned()]);
        assert_eq!(state.metadata.parent_query.as_deref(), Some("value-1/add-2"));
        assert_eq!(state.type_identifier(), "generic");
        Ok(())
    }

    #[test]
    fn unknown_action() -> Result<(), Error> {
        let env = environment()?;
        let state = env.evaluate("value-1/unknown")?;
        assert!(state.is_error());
        assert_eq!(
            state.metadata.error.as_ref().map(|e| e.error_type),
            Some(ErrorType::ActionNotRegistered)
        );
        assert_eq!(state.metadata.commands.len(), 2);
        Ok(())
    }

    #[test]
    fn argument_error_position() -> Result<(), Error> {
        let env = environment()?;
        let state = env.evaluate("value-1/add-x1")?;
        let error = state.get().unwrap_err();
        assert_eq!(error.error_type, ErrorType::ArgumentParseError);
        assert_eq!(error.position.offset, 12);
        Ok(())
    }

    #[test]
    fn parse_error() -> Result<(), Error> {
        let env = environment()?;
        let state = env.evaluate("value-1/~X~add")?;
        assert!(state.is_error());
        Ok(())
    }

    #[test]
    fn attributes_and_vars() -> Result<(), Error> {
        let env = environment()?;
        let mut tag = CommandMetadata::new("tag");
        tag.with_attribute("Persistent", "yes").with_attribute("local", "no");
        env.register_command(tag, |state, _, context| {
            context.set_var("tagged", true);
            Ok((*state.data).clone())
        })?;
        let state = env.evaluate("value-1/tag/add")?;
        assert_eq!(state.metadata.get_attribute("Persistent"), Some(&JsonValue::from("yes")));
        assert!(state.metadata.get_attribute("local").is_none());
        assert_eq!(state.metadata.vars.get("tagged"), Some(&JsonValue::Bool(true)));
        Ok(())
    }

    #[test]
    fn namespaces() -> Result<(), Error> {
        let env = environment()?;
        let mut add = CommandMetadata::new("add");
        add.with_namespace("ten");
        env.register_command(add, |state, _, _| Ok(Value::I64(state.get()?.try_into_i64()? + 10)))?;
        assert_eq!(*env.evaluate("value-1/add")?.get()?, Value::I64(2));
        assert_eq!(*env.evaluate("value-1/ns-ten/add")?.get()?, Value::I64(11));
        Ok(())
    }

    #[test]
    fn volatile_results_are_not_cached() -> Result<(), Error> {
        let env = environment()?;
        let cache = Arc::new(MemoryCache::new());
        env.with_cache(cache.clone());
        let mut now = CommandMetadata::first("now");
        now.volatile();
        env.register_command(now, |_, _, _| Ok(Value::new("now")))?;
        let state = env.evaluate("now")?;
        assert!(state.is_volatile());
        assert!(cache.get("now").is_none());
        Ok(())
    }

    #[test]
    fn child_log_and_progress() -> Result<(), Error> {
        let env = environment()?;
        let mut inner = CommandMetadata::first("inner");
        inner.with_argument(ArgumentInfo::integer_argument("n"));
        env.register_command(inner, |_, args, context| {
            let n: i64 = args.get(0, "n")?;
            context.progress(1, Some(2), "half")?;
            context.info(&format!("inner {}", n));
            Ok(Value::I64(n))
        })?;
        let outer = CommandMetadata::first("outer");
        env.register_command(outer, |_, _, context| {
            let mut sum = 0;
            for i in 0..7 {
                sum += context.evaluate(&format!("inner-{}", i))?.get()?.try_into_i64()?;
            }
            Ok(Value::I64(sum))
        })?;
        let state = env.evaluate("outer")?;
        assert_eq!(*state.get()?, Value::I64(21));
        assert_eq!(state.metadata.direct_subqueries.len(), 7);
        assert_eq!(state.metadata.child_log.len(), CHILD_LOG_SIZE);
        assert_eq!(state.metadata.child_log.last().unwrap().origin.as_deref(), Some("inner-6"));
        assert_eq!(state.metadata.child_progress_indicators.len(), 7);
        Ok(())
    }

    #[test]
    fn progress_iter_reports_steps() -> Result<(), Error> {
        let env = environment()?;
        let sum = CommandMetadata::first("sum");
        env.register_command(sum, |_, _, context| {
            let values = context.progress_iter("summing", vec![1, 2, 3], |_, x| Ok(x * 2))?;
            Ok(Value::I64(values.iter().sum()))
        })?;
        let state = env.evaluate("sum")?;
        assert_eq!(*state.get()?, Value::I64(12));
        let indicator = &state.metadata.progress_indicators[0];
        assert_eq!(indicator.step, 3);
        assert_eq!(indicator.total, Some(3));
        Ok(())
    }

    #[test]
    fn cancelled_evaluation() -> Result<(), Error> {
        let env = environment()?;
        let flag = Arc::new(AtomicBool::new(true));
        let state = env.new_context().with_cancel_flag(flag).evaluate("value-1")?;
        assert!(state.is_error());
        Ok(())
    }

    #[test]
    fn resource_metadata_and_directory() -> Result<(), Error> {
        let env = environment()?;
        let store = Arc::new(MemoryStore::default());
        store.set(&crate::parse::parse_key("d/x.txt")?, b"text", &Metadata::new())?;
        env.with_store(store);
        let state = env.evaluate("-R/d/x.txt")?;
        assert_eq!(*state.get()?, Value::new("text"));
        assert_eq!(state.type_identifier(), "text");
        let state = env.evaluate("-R/d")?;
        assert_eq!(*state.get()?, Value::Array(vec![Value::new("x.txt")]));
        let state = env.evaluate("-R-meta/d/x.txt")?;
        assert!(matches!(&*state.data, Value::Object(_)));
        let state = env.evaluate("-R/missing")?;
        assert_eq!(
            state.get().unwrap_err().error_type,
            ErrorType::KeyNotFound
        );
        Ok(())
    }

    #[test]
    fn dependencies_of_query() -> Result<(), Error> {
        let env = environment()?;
        let context = env.new_context();
        let deps = context.dependencies("value-1/add-~X~add-2~E")?;
        assert_eq!(deps.commands.len(), 2);
        assert!(deps.commands.contains_key("ns-root/add"));
        Ok(())
    }

    #[test]
    fn version_collision_is_raised() -> Result<(), Error> {
        let env = environment()?;
        env.with_cache(Arc::new(MemoryCache::new()));
        env.evaluate("value-1/add")?;
        let mut add = CommandMetadata::new("add");
        add.with_argument(ArgumentInfo::integer_argument("y").with_default(1))
            .modify_command()
            .with_version("2");
        env.register_command(add, |_, _, _| Ok(Value::I64(0)))?;
        let mut context = env.new_context();
        let cached = env.get_cache().get("value-1/add").unwrap();
        assert!(context.check_dependencies(&cached.metadata.dependencies).is_err());
        let err = context.evaluate("value-1/add").unwrap_err();
        assert_eq!(err.error_type, ErrorType::VersionCollision);
        Ok(())
    }

    #[test]
    fn default_environment_is_shared() {
        let a = default_environment();
        let b = default_environment();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
