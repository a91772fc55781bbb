//! Task layout of one isolation context
//!
//! The router drains the inbound channel without ever blocking on plugin code:
//! bridge replies go straight to the waiting guest call, requests and bus
//! deliveries are queued for the worker, which owns the entry point. When the
//! worker ends (shutdown or panic) the router exits and the outbound channel
//! closes, which is how the host notices a dead context.

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use super::entry::{GuestContext, PluginEntry};
use super::protocol::{Envelope, HostRequest, Inbound, Outbound};

pub(crate) struct ContextChannels {
    pub inbound: mpsc::Sender<Envelope<Inbound>>,
    pub outbound: mpsc::Receiver<Envelope<Outbound>>,
    pub router: AbortHandle,
    pub worker: AbortHandle,
}

pub(crate) fn spawn_context(
    plugin_id: &str,
    entry: Box<dyn PluginEntry>,
    queue_depth: usize,
) -> ContextChannels {
    let depth = queue_depth.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(depth);
    let (outbound_tx, outbound_rx) = mpsc::channel(depth);
    let (work_tx, work_rx) = mpsc::channel(depth);

    let ctx = GuestContext::new(plugin_id, outbound_tx);
    let worker = tokio::spawn(run_worker(entry, ctx.clone(), work_rx));
    let worker_abort = worker.abort_handle();
    let router = tokio::spawn(route(ctx, inbound_rx, work_tx, worker));

    ContextChannels {
        inbound: inbound_tx,
        outbound: outbound_rx,
        router: router.abort_handle(),
        worker: worker_abort,
    }
}

async fn route(
    ctx: GuestContext,
    mut inbound: mpsc::Receiver<Envelope<Inbound>>,
    work: mpsc::Sender<Envelope<Inbound>>,
    mut worker: JoinHandle<()>,
) {
    loop {
        tokio::select! {
            finished = &mut worker => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        warn!(plugin_id = %ctx.plugin_id(), "Plugin context panicked");
                    }
                }
                break;
            }
            message = inbound.recv() => {
                let Some(envelope) = message else { break };
                let correlation_id = envelope.correlation_id;
                match envelope.body {
                    Inbound::BridgeReply(result) => ctx.resolve(correlation_id, result),
                    body => {
                        let is_request = matches!(body, Inbound::Request(_));
                        let queued = Envelope { body, ..envelope };
                        if work.try_send(queued).is_err() {
                            if is_request {
                                ctx.try_reply(correlation_id, Err("plugin is busy".to_string()));
                            } else {
                                debug!(plugin_id = %ctx.plugin_id(), "Worker queue full, delivery dropped");
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn run_worker(
    mut entry: Box<dyn PluginEntry>,
    ctx: GuestContext,
    mut work: mpsc::Receiver<Envelope<Inbound>>,
) {
    while let Some(envelope) = work.recv().await {
        let correlation_id = envelope.correlation_id;
        match envelope.body {
            Inbound::Request(HostRequest::Invoke { command, args }) => {
                let result = entry.handle(&ctx, &command, args).await;
                ctx.reply(correlation_id, result).await;
            }
            Inbound::Request(HostRequest::Ping) => {
                ctx.reply(correlation_id, Ok(json!("pong"))).await;
            }
            Inbound::Request(HostRequest::Shutdown) => {
                entry.shutdown(&ctx).await;
                ctx.reply(correlation_id, Ok(Value::Null)).await;
                break;
            }
            Inbound::Deliver(message) => entry.on_message(&ctx, message).await,
            Inbound::BridgeReply(_) => {}
        }
    }
}
