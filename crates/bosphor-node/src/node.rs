use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bosphor_consensus::{Backend, Engine, EngineHandle};
use bosphor_core::Block;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::backend::NodeBackend;
use crate::chain::MemoryChain;
use crate::config::NodeConfig;
use crate::network::{LocalNetwork, NetMessage};
use crate::pool::{encode_payload, TxPool};

/// One validator of the devnet
struct DevnetNode {
    backend: Arc<NodeBackend>,
    engine: Engine<Block, NodeBackend>,
    inbox: Option<mpsc::UnboundedReceiver<NetMessage>>,
}

/// Production timing shared by every producer
#[derive(Debug, Clone, Copy)]
struct Production {
    block_period: Duration,
    block_pause_time: Duration,
    max_block_txs: usize,
}

/// In-process devnet: every validator runs its own engine and chain over a
/// shared in-memory network
pub struct Devnet {
    config: NodeConfig,
    network: Arc<LocalNetwork>,
    pool: Arc<TxPool>,
    nodes: Vec<DevnetNode>,
}

impl Devnet {
    /// Create a devnet from configuration
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let genesis = config.to_genesis_config()?.create_genesis_block();
        let network = Arc::new(LocalNetwork::new());
        let pool = Arc::new(TxPool::new(config.pool_max_size));

        let changes = config.validator_changes()?;

        let mut nodes = Vec::new();
        for key in config.keypairs()? {
            let mut chain = MemoryChain::new(
                genesis.clone(),
                config.consensus.epoch,
                config.consensus.block_period_s,
                config.consensus.proposer_policy,
            )?;
            for change in &changes {
                chain.propose_change(*change);
            }
            let inbox = network.register(key.address());
            let backend = Arc::new(NodeBackend::new(key, chain, Arc::clone(&network)));
            let engine = Engine::new(Arc::clone(&backend), config.consensus.clone());
            nodes.push(DevnetNode {
                backend,
                engine,
                inbox: Some(inbox),
            });
        }

        info!(
            "Devnet genesis {} with {} validators",
            genesis.hash().short(),
            network.peer_count()
        );

        Ok(Devnet {
            config,
            network,
            pool,
            nodes,
        })
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn backend(&self, index: usize) -> Option<&Arc<NodeBackend>> {
        self.nodes.get(index).map(|node| &node.backend)
    }

    /// Lowest height across validators
    pub fn height(&self) -> u64 {
        self.nodes
            .iter()
            .map(|node| node.backend.height())
            .min()
            .unwrap_or_default()
    }

    /// Run until every validator has `max_blocks` blocks, or until Ctrl-C
    /// when no target is given. Returns the lowest height reached.
    pub async fn run(&mut self, max_blocks: Option<u64>) -> Result<u64> {
        info!("Starting devnet with {} validators", self.nodes.len());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let production = Production {
            block_period: self.config.consensus.block_period(),
            block_pause_time: self.config.consensus.block_pause_time(),
            max_block_txs: self.config.max_block_txs,
        };

        let mut tasks = JoinSet::new();
        for node in &mut self.nodes {
            let Some(inbox) = node.inbox.take() else {
                anyhow::bail!("Devnet can only run once");
            };
            node.engine.start()?;
            tasks.spawn(drive(
                Arc::clone(&node.backend),
                node.engine.handle(),
                inbox,
                Arc::clone(&self.pool),
                production,
                shutdown_rx.clone(),
            ));
        }

        if self.config.tx_interval_ms > 0 {
            tasks.spawn(feed(
                Arc::clone(&self.pool),
                Duration::from_millis(self.config.tx_interval_ms),
                shutdown_rx.clone(),
            ));
        }

        let mut progress = tokio::time::interval(Duration::from_millis(100));
        let mut reported = 0;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
                _ = progress.tick() => {
                    let height = self.height();
                    if height > reported {
                        reported = height;
                        info!("Devnet height {} ({} pending txs)", height, self.pool.len());
                    }
                    if max_blocks.is_some_and(|target| height >= target) {
                        break;
                    }
                }
            }
        }

        // Ignored when every task already exited
        let _ = shutdown_tx.send(true);
        while let Some(joined) = tasks.join_next().await {
            joined?;
        }
        for node in &mut self.nodes {
            node.engine.stop().await?;
            self.network.disconnect(&node.backend.address());
        }

        let height = self.height();
        match self.nodes.first().and_then(|node| node.backend.block(height)) {
            Some(block) => info!(
                "Devnet stopped at height {} ({})",
                height,
                block.hash().short()
            ),
            None => info!("Devnet stopped at height {}", height),
        }
        Ok(height)
    }
}

/// Pump one validator: deliver network traffic to its engine, report new
/// heads and propose a block once the production delay has elapsed
async fn drive(
    backend: Arc<NodeBackend>,
    handle: EngineHandle<Block>,
    mut inbox: mpsc::UnboundedReceiver<NetMessage>,
    pool: Arc<TxPool>,
    production: Production,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut head_rx = backend.subscribe_head();
    let produce = sleep(production.block_period);
    tokio::pin!(produce);
    let mut armed = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = inbox.recv() => match message {
                Some(NetMessage::Consensus(payload)) => {
                    if let Err(e) = handle.handle_message(payload) {
                        warn!("Engine refused message: {}", e);
                        break;
                    }
                }
                Some(NetMessage::Block(block)) => {
                    let number = block.number();
                    match backend.import(block) {
                        Ok(true) => info!("Imported announced block {}", number),
                        Ok(false) => {}
                        Err(e) => debug!("Ignored announced block {}: {}", number, e),
                    }
                }
                None => break,
            },
            changed = head_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let head = head_rx.borrow_and_update().clone();
                pool.remove_committed(&head);
                if let Err(e) = handle.final_committed() {
                    warn!("Engine refused new head: {}", e);
                    break;
                }
                let delay = if pool.is_empty() {
                    production.block_pause_time
                } else {
                    production.block_period
                };
                produce.as_mut().reset(Instant::now() + delay);
                armed = true;
            }
            _ = &mut produce, if armed => {
                armed = false;
                let txs = pool.batch(production.max_block_txs);
                let payload = match encode_payload(&txs) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode block payload: {}", e);
                        Vec::new()
                    }
                };
                let block = backend.build_block(payload);
                debug!("Requesting block {} with {} txs", block.number(), txs.len());
                if let Err(e) = handle.request(block) {
                    warn!("Engine refused request: {}", e);
                    break;
                }
            }
        }
    }
}

/// Feed the pool with random transactions
async fn feed(pool: Arc<TxPool>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let tx: [u8; 32] = rand::random();
                if !pool.submit(tx.to_vec()) {
                    debug!("Transaction pool full");
                }
            }
        }
    }
}
