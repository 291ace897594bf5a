use crate::config::{self, RuntimeConfig};
use crate::gateway::{self, Gateway};
use crate::metrics;
use crate::storage::{MemoryStorage, SnapshotHandle};
use crate::tob::election::FirstMember;
use crate::tob::node::{Node, NodeStatus};
use crate::tob::NodeId;
use crate::transport::{self, PeerTransport};

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};
use slog::{o, Drain};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const LOGGER_CHANNEL_SIZE: usize = 4096; // Size of logger channel buffer

pub struct Server {
    config: &'static RuntimeConfig,
    tasks: Vec<JoinHandle<()>>,
    status: Option<watch::Receiver<NodeStatus>>,
}

impl Server {
    pub fn builder() -> anyhow::Result<Self> {
        let config = config::instance().context("runtime config is not loaded")?;
        config.validate()?;
        Ok(Server {
            config,
            tasks: Vec::new(),
            status: None,
        })
    }

    fn init_logger(&self) -> slog::Logger {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        slog::Logger::root(drain, o!())
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        let logger = self.init_logger();
        let config = self.config;
        let id = NodeId::from(config.id.as_str());
        let members = config.members();

        let storage = MemoryStorage::new(&config.keyspace, &config.snapshot_dir);
        let (node, mailboxes) =
            Node::new(id.clone(), members.clone(), &FirstMember, storage, &logger)?;
        let mut node =
            node.with_snapshot_interval(Duration::from_secs(config.snapshot_interval_secs));
        if let Some(path) = &config.restore_from {
            node.restore(&SnapshotHandle::from(path.as_str()))
                .with_context(|| format!("failed to restore snapshot {}", path))?;
        }
        log::info!("node {} started, leader is {}", id, node.leader());

        let gateway = Arc::new(Gateway::new(node.leader().clone(), mailboxes.outbox.clone()));
        let peer_transport = PeerTransport::new(id, config.peer_addrs(), mailboxes.inbox.clone());
        self.tasks.push(tokio::spawn(transport::run_out_messages(
            peer_transport,
            mailboxes.outgoing,
        )));
        self.tasks.push(tokio::spawn(node.run()));
        self.status = Some(mailboxes.status);

        self.start_peer_server(members, mailboxes.inbox).await?;
        self.start_client_server(gateway).await?;
        self.start_metrics_server().await?;
        Ok(())
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(status) = &self.status {
            let status = status.borrow();
            log::info!(
                "server stop, applied {} proposals, next expected {}, {} pending",
                status.applied,
                status.next_expected,
                status.pending
            );
        }
    }

    async fn start_peer_server(
        &mut self,
        members: Vec<NodeId>,
        inbox: tokio::sync::mpsc::UnboundedSender<crate::tob::Envelope>,
    ) -> anyhow::Result<()> {
        let addr = &self.config.addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind peer listener on {}", addr))?;
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = transport::serve_peers(listener, members, inbox).await {
                log::error!("peer server stopped: {}", e);
            }
        }));
        log::info!("peer server started on {}", addr);
        Ok(())
    }

    async fn start_client_server(&mut self, gateway: Arc<Gateway>) -> anyhow::Result<()> {
        let addr = &self.config.client_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind client listener on {}", addr))?;
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = gateway::serve_clients(listener, gateway).await {
                log::error!("client server stopped: {}", e);
            }
        }));
        log::info!("client server started on {}", addr);
        Ok(())
    }

    async fn start_metrics_server(&mut self) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .metrics_addr
            .parse()
            .with_context(|| format!("invalid metrics_addr {}", self.config.metrics_addr))?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::error!("failed to encode metrics: {}", e);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server stopped: {}", e);
            }
        }));
        log::info!("metrics server started on {}", addr);
        Ok(())
    }
}
