use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Proposal};
use crate::config::Config;
use crate::error::ConsensusError;
use crate::events::{Effect, Event};
use crate::message::Message;
use crate::state_machine::{log_error, Core};

/// Outcome of an off-loop proposal check
type Verified<P> = (Message, P, Result<(), ConsensusError>);

/// Cloneable sender for engine events
#[derive(Debug, Clone)]
pub struct EngineHandle<P> {
    tx: mpsc::UnboundedSender<Event<P>>,
}

impl<P: Proposal> EngineHandle<P> {
    fn channel() -> (Self, mpsc::UnboundedReceiver<Event<P>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EngineHandle { tx }, rx)
    }

    /// Offer a proposal for the current sequence
    pub fn request(&self, proposal: P) -> Result<(), ConsensusError> {
        self.post(Event::Request(proposal))
    }

    /// Deliver an encoded consensus message from a peer
    pub fn handle_message(&self, payload: Vec<u8>) -> Result<(), ConsensusError> {
        self.post(Event::Message(payload))
    }

    /// Report that the chain head advanced
    pub fn final_committed(&self) -> Result<(), ConsensusError> {
        self.post(Event::FinalCommitted)
    }

    fn post(&self, event: Event<P>) -> Result<(), ConsensusError> {
        self.tx.send(event).map_err(|_| ConsensusError::EngineStopped)
    }
}

struct Running<P> {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<mpsc::UnboundedReceiver<Event<P>>>,
}

/// Runs a consensus [`Core`] on its own task.
///
/// All events go through one queue so the core only ever has a single
/// writer. Proposal verification happens on the blocking pool and reports
/// back into the same loop.
pub struct Engine<P: Proposal, B: Backend<P>> {
    backend: Arc<B>,
    config: Config,
    handle: EngineHandle<P>,
    inbox: Option<mpsc::UnboundedReceiver<Event<P>>>,
    running: Option<Running<P>>,
}

impl<P: Proposal, B: Backend<P>> Engine<P, B> {
    pub fn new(backend: Arc<B>, config: Config) -> Self {
        let (handle, inbox) = EngineHandle::channel();
        Engine {
            backend,
            config,
            handle,
            inbox: Some(inbox),
            running: None,
        }
    }

    pub fn handle(&self) -> EngineHandle<P> {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start the consensus loop; a second call while running does nothing
    pub fn start(&mut self) -> Result<(), ConsensusError> {
        if self.running.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        let inbox = self.inbox.take().ok_or(ConsensusError::EngineStopped)?;

        let core = Core::new(self.config.clone(), Arc::clone(&self.backend));
        info!(
            "Starting consensus engine for {} at view {}",
            core.address(),
            core.view()
        );

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(
            core,
            Arc::clone(&self.backend),
            self.config.verify_workers,
            inbox,
            shutdown_rx,
        ));
        self.running = Some(Running { shutdown, task });
        Ok(())
    }

    /// Stop the consensus loop and wait for it to exit; a second call does nothing
    pub async fn stop(&mut self) -> Result<(), ConsensusError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(());

        match running.task.await {
            Ok(inbox) => self.inbox = Some(inbox),
            Err(e) => {
                warn!("Consensus task ended abnormally: {}", e);
                let (handle, inbox) = EngineHandle::channel();
                self.handle = handle;
                self.inbox = Some(inbox);
            }
        }
        info!("Consensus engine stopped");
        Ok(())
    }
}

impl<P: Proposal, B: Backend<P>> Drop for Engine<P, B> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
        }
    }
}

async fn run<P: Proposal, B: Backend<P>>(
    mut core: Core<P, B>,
    backend: Arc<B>,
    workers: usize,
    mut inbox: mpsc::UnboundedReceiver<Event<P>>,
    mut shutdown: oneshot::Receiver<()>,
) -> mpsc::UnboundedReceiver<Event<P>> {
    let permits = Arc::new(Semaphore::new(workers));
    let mut verifications: JoinSet<Verified<P>> = JoinSet::new();
    let timer = tokio::time::sleep_until(Instant::now());
    tokio::pin!(timer);
    let mut armed = false;

    loop {
        for effect in core.take_effects() {
            match effect {
                Effect::ResetTimer(timeout) => {
                    timer.as_mut().reset(Instant::now() + timeout);
                    armed = true;
                }
                Effect::Verify { message, proposal } => {
                    spawn_verification(&mut verifications, &permits, &backend, message, proposal);
                }
            }
        }

        tokio::select! {
            _ = &mut shutdown => break,
            event = inbox.recv() => match event {
                Some(event) => handle_event(&mut core, event),
                None => break,
            },
            Some(joined) = verifications.join_next() => match joined {
                Ok((message, proposal, result)) => {
                    if let Err(e) = core.handle_verified(message, proposal, result) {
                        log_error(&e);
                    }
                }
                Err(e) => warn!("Verification task failed: {}", e),
            },
            _ = &mut timer, if armed => {
                armed = false;
                core.handle_timeout();
            }
        }
    }

    verifications.abort_all();
    debug!("Consensus loop for {} exited", core.address());
    inbox
}

fn handle_event<P: Proposal, B: Backend<P>>(core: &mut Core<P, B>, event: Event<P>) {
    let result = match event {
        Event::Request(proposal) => core.handle_request(proposal),
        Event::Message(payload) => core.handle_message(&payload),
        Event::FinalCommitted => core.handle_final_committed(),
    };
    if let Err(e) = result {
        log_error(&e);
    }
}

fn spawn_verification<P: Proposal, B: Backend<P>>(
    verifications: &mut JoinSet<Verified<P>>,
    permits: &Arc<Semaphore>,
    backend: &Arc<B>,
    message: Message,
    proposal: P,
) {
    let permits = Arc::clone(permits);
    let backend = Arc::clone(backend);

    verifications.spawn(async move {
        let permit = permits.acquire_owned().await.ok();
        let candidate = proposal.clone();
        let verified = tokio::task::spawn_blocking(move || backend.verify(&candidate))
            .await
            .unwrap_or_else(|e| {
                Err(ConsensusError::InvalidProposal(format!(
                    "verification task failed: {}",
                    e
                )))
            });
        drop(permit);

        let result = match verified {
            Ok(delay) if !delay.is_zero() => {
                debug!(
                    "Proposal {} is early, waiting {:?}",
                    proposal.hash().short(),
                    delay
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        (message, proposal, result)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosphor_core::Block;

    #[test]
    fn test_handle_reports_stopped_engine() {
        let (handle, inbox) = EngineHandle::<Block>::channel();
        handle.final_committed().unwrap();
        drop(inbox);
        assert!(matches!(
            handle.final_committed(),
            Err(ConsensusError::EngineStopped)
        ));
    }
}
