//! Startup orchestration.

use crate::{
    CanTransport, CommandQueue, Config, Error, HeatPumpClient, ParameterRegistry, Result,
    discovery::{ElementDiscovery, ElementSource, cache::CacheStore},
    queue::{EXTRA_HOT_WATER, EntityKind, ExtraHotWater},
};
use embedded_io_async::{Read, Write};
use log::info;
use std::sync::Arc;

/// A connected protocol engine.
///
/// Owns the transport, the registry and the command queue for one adapter.
/// The registry has already been updated with the device's live index table,
/// so every index resolved through the client is trusted.
#[derive(Debug)]
pub struct Engine<P: Read + Write> {
    transport: Arc<CanTransport<P>>,
    registry: Arc<ParameterRegistry>,
    client: HeatPumpClient<P>,
    queue: CommandQueue<P>,
    source: ElementSource,
}

impl<P: Read + Write> Engine<P> {
    /// Connects the adapter and resolves the parameter index table.
    ///
    /// Element discovery follows the cache policy of
    /// [`ElementDiscovery::resolve`]. If neither the device nor the cache
    /// provides a usable table, the adapter is disconnected and
    /// [`Error::DiscoveryRequired`] is returned.
    pub async fn start<S>(port: P, config: &Config, store: &S) -> Result<Self, P::Error>
    where
        S: CacheStore + ?Sized,
    {
        config
            .validate()
            .map_err(|err| Error::InvalidInput(err.to_string()))?;

        let transport = Arc::new(CanTransport::new(config.transport.clone()));

        transport.connect(port).await?;

        let resolved = match ElementDiscovery::new(&transport, &config.discovery)
            .resolve(store)
            .await
        {
            Ok(resolved) => resolved,
            Err(err) => {
                transport.disconnect().await;
                return Err(err);
            }
        };

        let registry = Arc::new(ParameterRegistry::new());
        let changed = registry.override_from_discovery(&resolved.elements);

        info!(
            "Loaded {} element(s) from {} source, {changed} parameter(s) changed",
            resolved.elements.len(),
            resolved.source
        );

        let client = HeatPumpClient::new(Arc::clone(&transport), Arc::clone(&registry));
        let mut queue = CommandQueue::new(client.clone(), config.queue.clone());

        queue.register_composite(EXTRA_HOT_WATER, EntityKind::Switch, ExtraHotWater::default());

        Ok(Self {
            transport,
            registry,
            client,
            queue,
            source: resolved.source,
        })
    }

    /// Returns the parameter client.
    pub fn client(&self) -> &HeatPumpClient<P> {
        &self.client
    }

    /// Returns the command queue.
    pub fn queue(&self) -> &CommandQueue<P> {
        &self.queue
    }

    /// Returns the command queue for registering entities and callbacks.
    pub fn queue_mut(&mut self) -> &mut CommandQueue<P> {
        &mut self.queue
    }

    /// Returns the parameter registry.
    pub fn registry(&self) -> &Arc<ParameterRegistry> {
        &self.registry
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<CanTransport<P>> {
        &self.transport
    }

    /// Returns where the index table came from.
    pub fn source(&self) -> ElementSource {
        self.source
    }

    /// Drops pending commands and disconnects the adapter.
    pub async fn shutdown(self) {
        self.queue.clear();
        self.transport.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::Value,
        discovery::{
            DiscoveredElement, DiscoveryReport,
            cache::{CacheSnapshot, MemoryCacheStore},
            parser,
        },
        queue::CommandStatus,
        test_utils::{MockAdapter, init_logger, script_discovery},
    };
    use core::{convert::Infallible, time::Duration};

    fn xdhw_time() -> DiscoveredElement {
        DiscoveredElement {
            idx: 2480,
            ext_id: "61E1E1FC660023".into(),
            name: "XDHW_TIME".into(),
            min: 0,
            max: 48,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discovered_index_is_used() -> Result<(), Infallible> {
        init_logger();

        let adapter = MockAdapter::connected();
        let store = MemoryCacheStore::new();
        let table = parser::encode_record(&xdhw_time());

        assert_eq!(table.len(), 18 + 9, "record should be 27 bytes");

        script_discovery(&adapter, &table, 27);

        let engine = Engine::start(adapter.clone(), &Config::default(), &store).await?;

        assert_eq!(engine.source(), ElementSource::Live, "elements should be live");
        assert_eq!(
            engine.registry().get_by_name("XDHW_TIME").map(|p| p.idx),
            Some(2480),
            "index should be overridden"
        );
        assert_eq!(
            store.snapshot().map(|s| s.elements),
            Some(vec![xdhw_time()]),
            "result should be cached"
        );

        adapter.reply("T0E6C3FE0105\r");

        let reading = engine
            .client()
            .read_parameter("XDHW_TIME", Duration::from_secs(1))
            .await?;

        assert_eq!(
            adapter.written().last().map(String::as_str),
            Some("R066C3FE00\r"),
            "request should use the discovered index"
        );
        assert_eq!(reading.value, Value::Integer(5), "value should be decoded");

        engine.shutdown().await;

        assert_eq!(
            adapter.written().last().map(String::as_str),
            Some("C\r"),
            "channel should be closed on shutdown"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_skips_discovery() -> Result<(), Infallible> {
        init_logger();

        let adapter = MockAdapter::connected();
        let snapshot = CacheSnapshot::from_report(&DiscoveryReport {
            elements: vec![xdhw_time()],
            reported_bytes: 27,
            actual_bytes: 27,
            skipped_bytes: 0,
        });
        let store = MemoryCacheStore::with_snapshot(snapshot);
        let engine = Engine::start(adapter.clone(), &Config::default(), &store).await?;

        assert_eq!(engine.source(), ElementSource::Cache, "cache should be used");
        assert_eq!(adapter.written().len(), 7, "only the handshake should be sent");
        assert_eq!(
            engine.registry().get_by_index(2480).map(|p| p.name),
            Some("XDHW_TIME".into()),
            "cached index should be applied"
        );

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_required() {
        init_logger();

        let adapter = MockAdapter::connected();
        let store = MemoryCacheStore::new();
        let res = Engine::start(adapter.clone(), &Config::default(), &store).await;

        assert!(
            matches!(res, Err(Error::DiscoveryRequired(_))),
            "startup should fail without a usable table"
        );
        assert_eq!(
            adapter.written().last().map(String::as_str),
            Some("C\r"),
            "adapter should be disconnected"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn writes_go_through_queue() -> Result<(), Infallible> {
        init_logger();

        let adapter = MockAdapter::connected();
        let store = MemoryCacheStore::new();

        script_discovery(&adapter, &parser::encode_record(&xdhw_time()), 27);

        let engine = Engine::start(adapter.clone(), &Config::default(), &store).await?;

        adapter.reply("Z\r");
        engine.queue().enqueue("XDHW_TIME", "5")?;

        let result = engine.queue().process_one().await;

        assert_eq!(
            result.map(|res| res.status),
            Some(CommandStatus::Success),
            "write should succeed"
        );
        assert_eq!(
            adapter.written().last().map(String::as_str),
            Some("T066C3FE0105\r"),
            "write should use the discovered index"
        );

        Ok(())
    }
}
