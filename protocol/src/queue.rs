//! Rate-limited write dispatch.
//!
//! The [`CommandQueue`] is the only path that issues writes. Producers
//! [`enqueue`](CommandQueue::enqueue) human-readable values, which are validated
//! immediately. A single consumer calls [`process_one`](CommandQueue::process_one)
//! to dispatch them one at a time, keeping the controller's minimum spacing
//! between commands.

use crate::{Error, ErrorKind, HeatPumpClient, ParameterKey, Result, config::QueueConfig};
use embedded_io_async::{Read, Write};
use log::{debug, info, warn};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::time::{Instant, sleep_until};

/// Name under which [`ExtraHotWater`] is usually registered.
pub const EXTRA_HOT_WATER: &str = "extra_hot_water";

/// How an entity accepts values.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum EntityKind {
    /// Accepts `on` or `off`, written as 1 or 0.
    Switch,
    /// Accepts one of the options, written as its position.
    Select(Vec<String>),
    /// Accepts a decimal number.
    Number,
}

/// What a command ultimately writes.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum CommandTarget {
    /// A single parameter.
    Parameter(ParameterKey),
    /// A registered composite operation.
    Composite(String),
}

/// A writable entity exposed to producers.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Entity {
    /// Identifier used when enqueueing.
    pub id: String,
    /// Accepted values.
    pub kind: EntityKind,
    /// Write target.
    pub target: CommandTarget,
}

impl Entity {
    /// Constructs an entity backed by a single parameter.
    pub fn parameter(id: impl Into<String>, kind: EntityKind, key: impl Into<ParameterKey>) -> Self {
        Self {
            id: id.into(),
            kind,
            target: CommandTarget::Parameter(key.into()),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn parse(&self, input: &str) -> Option<f64> {
        let input = input.trim();

        match &self.kind {
            EntityKind::Switch => match input.to_ascii_lowercase().as_str() {
                "on" => Some(1.0),
                "off" => Some(0.0),
                _ => None,
            },
            EntityKind::Select(options) => options
                .iter()
                .position(|opt| opt.eq_ignore_ascii_case(input))
                .map(|pos| pos as f64),
            EntityKind::Number => input.parse().ok().filter(|val: &f64| val.is_finite()),
        }
    }
}

/// A validated write waiting for dispatch.
#[derive(PartialEq, Clone, Debug)]
pub struct Command {
    /// Entity the command was enqueued for.
    pub entity: String,
    /// Value as supplied by the producer.
    pub input: String,
    /// Write target.
    pub target: CommandTarget,
    /// Validated numeric value.
    pub value: f64,
    /// Time of enqueueing.
    pub enqueued_at: Instant,
}

/// Outcome of a dispatched command.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "snake_case")]
pub enum CommandStatus {
    /// The value was written.
    Success,
    /// The write failed.
    Failed,
    /// The command expired or the write timed out.
    Timeout,
    /// The command could not be applied to its target.
    Invalid,
}

/// Result passed to the result callback.
#[derive(PartialEq, Clone, Debug)]
pub struct CommandResult {
    /// Entity the command was enqueued for.
    pub entity: String,
    /// Outcome.
    pub status: CommandStatus,
    /// Human-readable detail.
    pub message: String,
    /// Value written, if any.
    pub value: Option<f64>,
}

impl CommandResult {
    fn new(cmd: &Command, status: CommandStatus, message: impl Into<String>) -> Self {
        Self {
            entity: cmd.entity.clone(),
            status,
            message: message.into(),
            value: None,
        }
    }
}

/// A write to a virtual entity that is not backed by a single parameter.
#[async_trait::async_trait(?Send)]
pub trait CompositeOperation<P: Read + Write> {
    /// Performs the write and returns the value that was applied.
    async fn execute(
        &self,
        client: &HeatPumpClient<P>,
        value: f64,
        timeout: Duration,
    ) -> Result<f64, P::Error>;
}

/// Extra hot water boost.
///
/// Switching on writes the stop temperature followed by the boost duration.
/// Switching off writes a zero duration.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct ExtraHotWater {
    /// Boost duration in hours.
    pub hours: u8,
    /// Stop temperature in °C.
    pub stop_temp: u8,
}

impl Default for ExtraHotWater {
    fn default() -> Self {
        Self {
            hours: 3,
            stop_temp: 60,
        }
    }
}

#[async_trait::async_trait(?Send)]
impl<P: Read + Write> CompositeOperation<P> for ExtraHotWater {
    async fn execute(
        &self,
        client: &HeatPumpClient<P>,
        value: f64,
        timeout: Duration,
    ) -> Result<f64, P::Error> {
        if value == 0.0 {
            client.write_value("XDHW_TIME", 0.0, timeout).await?;

            return Ok(0.0);
        }

        client
            .write_value("XDHW_STOP_TEMP", self.stop_temp.into(), timeout)
            .await?;
        client
            .write_value("XDHW_TIME", self.hours.into(), timeout)
            .await?;

        Ok(1.0)
    }
}

type ResultCallback = Box<dyn Fn(&CommandResult)>;

#[derive(Debug, Default)]
struct Schedule {
    pending: VecDeque<Command>,
    last_dispatch: Option<Instant>,
}

/// Queue of validated writes dispatched through a [`HeatPumpClient`].
///
/// Entities and composites are registered up front. Parameters without a
/// registered entity are accepted as numbers. Nothing is retried, failures
/// are reported through the result callback.
pub struct CommandQueue<P: Read + Write> {
    client: HeatPumpClient<P>,
    config: QueueConfig,
    entities: HashMap<String, Entity>,
    composites: HashMap<String, Box<dyn CompositeOperation<P>>>,
    callback: Option<ResultCallback>,
    schedule: Mutex<Schedule>,
}

impl<P: Read + Write> core::fmt::Debug for CommandQueue<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("config", &self.config)
            .field("entities", &self.entities)
            .field("composites", &self.composites.keys().collect::<Vec<_>>())
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl<P: Read + Write> CommandQueue<P> {
    /// Constructs an empty queue.
    pub fn new(client: HeatPumpClient<P>, config: QueueConfig) -> Self {
        Self {
            client,
            config,
            entities: HashMap::new(),
            composites: HashMap::new(),
            callback: None,
            schedule: Mutex::new(Schedule::default()),
        }
    }

    /// Registers an entity, replacing one with the same identifier.
    pub fn register_entity(&mut self, entity: Entity) {
        self.entities.insert(entity.id.to_ascii_lowercase(), entity);
    }

    /// Registers a composite operation together with its entity.
    pub fn register_composite(
        &mut self,
        name: impl Into<String>,
        kind: EntityKind,
        op: impl CompositeOperation<P> + 'static,
    ) {
        let name = name.into();

        self.register_entity(Entity {
            id: name.clone(),
            kind,
            target: CommandTarget::Composite(name.clone()),
        });
        self.composites.insert(name, Box::new(op));
    }

    /// Sets the callback invoked once per dispatched command.
    pub fn set_result_callback(&mut self, callback: impl Fn(&CommandResult) + 'static) {
        self.callback = Some(Box::new(callback));
    }

    fn schedule(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entity(&self, id: &str) -> Result<Entity, P::Error> {
        if let Some(entity) = self.entities.get(&id.to_ascii_lowercase()) {
            return Ok(entity.clone());
        }

        let Ok(key) = id.parse::<ParameterKey>();

        if self.client.registry().resolve(&key).is_none() {
            return Err(Error::UnknownParameter(key));
        }

        Ok(Entity {
            id: id.into(),
            kind: EntityKind::Number,
            target: CommandTarget::Parameter(key),
        })
    }

    /// Validates a value and appends it to the queue.
    ///
    /// Invalid values are rejected here and never enqueued. Values for
    /// parameter targets are range-checked against the current registry.
    pub fn enqueue(&self, entity: &str, input: &str) -> Result<(), P::Error> {
        let resolved = self.entity(entity)?;
        let value = resolved.parse(input).ok_or_else(|| {
            Error::InvalidInput(format!("{input:?} is not a valid value for {entity}"))
        })?;

        match &resolved.target {
            CommandTarget::Parameter(key) => {
                let param = self.client.registry().lookup::<P::Error>(key)?;

                if param.read_only {
                    return Err(Error::ReadOnly(param.name));
                }

                param.encode(value)?;
            }
            CommandTarget::Composite(name) => {
                if !self.composites.contains_key(name) {
                    return Err(Error::UnknownOperation(name.clone()));
                }
            }
        }

        debug!("Enqueued {input:?} for {entity}");

        self.schedule().pending.push_back(Command {
            entity: resolved.id,
            input: input.into(),
            target: resolved.target,
            value,
            enqueued_at: Instant::now(),
        });

        Ok(())
    }

    /// Returns the number of pending commands.
    pub fn len(&self) -> usize {
        self.schedule().pending.len()
    }

    /// Returns `true` if no commands are pending.
    pub fn is_empty(&self) -> bool {
        self.schedule().pending.is_empty()
    }

    /// Drops all pending commands and returns how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.schedule().pending.drain(..).count();

        if dropped > 0 {
            info!("Dropped {dropped} pending command(s)");
        }

        dropped
    }

    /// Dispatches the oldest pending command.
    ///
    /// Returns [`None`] if the queue is empty. Commands older than the expiry
    /// window resolve to [`CommandStatus::Timeout`] without touching the
    /// transport. Otherwise waits out the minimum delay since the previous
    /// dispatch before writing.
    pub async fn process_one(&self) -> Option<CommandResult> {
        let (cmd, last_dispatch) = {
            let mut schedule = self.schedule();

            (schedule.pending.pop_front()?, schedule.last_dispatch)
        };

        let age = cmd.enqueued_at.elapsed();
        let result = if age > self.config.expiry() {
            warn!("Command for {} expired after {age:?}", cmd.entity);
            CommandResult::new(&cmd, CommandStatus::Timeout, "command expired")
        } else {
            if let Some(last) = last_dispatch {
                sleep_until(last + self.config.min_delay()).await;
            }

            self.schedule().last_dispatch = Some(Instant::now());
            self.dispatch(&cmd).await
        };

        if let Some(callback) = &self.callback {
            callback(&result);
        }

        Some(result)
    }

    async fn dispatch(&self, cmd: &Command) -> CommandResult {
        let timeout = self.config.write_timeout();
        let res = match &cmd.target {
            CommandTarget::Parameter(key) => self
                .client
                .write_value(key.clone(), cmd.value, timeout)
                .await
                .map(|()| cmd.value),
            CommandTarget::Composite(name) => match self.composites.get(name) {
                Some(op) => op.execute(&self.client, cmd.value, timeout).await,
                None => Err(Error::UnknownOperation(name.clone())),
            },
        };

        match res {
            Ok(value) => {
                info!("Wrote {value} to {}", cmd.entity);

                CommandResult {
                    value: Some(value),
                    ..CommandResult::new(cmd, CommandStatus::Success, "ok")
                }
            }
            Err(err) => {
                warn!("Failed to write {} to {}: {err:?}", cmd.input, cmd.entity);

                let status = match err.kind() {
                    ErrorKind::Timeout => CommandStatus::Timeout,
                    ErrorKind::Validation => CommandStatus::Invalid,
                    _ => CommandStatus::Failed,
                };

                CommandResult::new(cmd, status, format!("{err:?}"))
            }
        }
    }
}
