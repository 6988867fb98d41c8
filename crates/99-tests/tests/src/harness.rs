use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, ensure, Context, Result};
use segfab::{
    CompletionQueue, CqAttr, CqEntry, Domain, Endpoint, EqAttr, EventKind, EventQueue, Fabric,
    FabricAttr, FabricError, Flags, Info, PassiveEndpoint, PeerAddr, Provider, ProviderConfig,
};
use segfab_interconnect::loopback::LoopbackFabric;
use segfab_interconnect::NodeId;
use segfab_transport::Timeout;

pub const SERVER_NODE: NodeId = 4;
pub const CLIENT_NODE: NodeId = 8;
pub const LISTEN_SEGMENT: u32 = 7;

/// Upper bound on any single wait in a scenario.
pub const PATIENCE: Timeout = Timeout::After(std::time::Duration::from_secs(5));

/// Config small enough that listeners and rings stay cheap.
pub fn config(buffer_size: usize) -> ProviderConfig {
    ProviderConfig {
        buffer_size,
        max_peers: 8,
        connect_timeout: PATIENCE,
        ..ProviderConfig::default()
    }
}

/// Everything one simulated node opens before it has an endpoint.
pub struct Node {
    pub provider: Arc<Provider>,
    pub fabric: Arc<Fabric>,
    pub domain: Arc<Domain>,
    pub eq: Arc<EventQueue>,
    pub cq: Arc<CompletionQueue>,
}

impl Node {
    pub fn open(switch: &Arc<LoopbackFabric>, node: NodeId, config: ProviderConfig) -> Result<Self> {
        let provider = Provider::new(switch.node(node), config)?;
        let fabric = Fabric::open(Arc::clone(&provider), &FabricAttr::default())?;
        let domain = fabric.domain(&Info::default())?;
        let eq = fabric.eq_open(EqAttr::default())?;
        let cq = domain.cq_open(CqAttr::default())?;
        Ok(Self {
            provider,
            fabric,
            domain,
            eq,
            cq,
        })
    }

    /// Opens an endpoint wired to this node's queues.
    pub fn endpoint(&self, info: &Info) -> Result<Endpoint> {
        let ep = self.domain.endpoint(info)?;
        ep.bind_eq(&self.eq)?;
        ep.bind_cq(&self.cq, Flags::SEND | Flags::RECV)?;
        ep.enable()?;
        Ok(ep)
    }

    fn with_endpoint(self, ep: Endpoint, listener: Option<PassiveEndpoint>) -> Peer {
        Peer {
            node: self,
            ep,
            _listener: listener,
        }
    }
}

/// A node with a connected endpoint.
pub struct Peer {
    pub node: Node,
    pub ep: Endpoint,
    _listener: Option<PassiveEndpoint>,
}

impl Peer {
    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.node.cq
    }

    pub fn eq(&self) -> &Arc<EventQueue> {
        &self.node.eq
    }

    /// Waits for the next successful completion.
    pub fn next_completion(&self) -> Result<CqEntry> {
        let mut entries = self.cq().sread(1, PATIENCE)?;
        entries.pop().context("sread returned no entries")
    }

    /// Waits for the next error completion, failing if a success shows up first.
    pub fn next_error(&self) -> Result<CqEntry> {
        match self.cq().sread(1, PATIENCE) {
            Err(FabricError::Avail) => Ok(self.cq().readerr()?),
            Ok(entries) => bail!("expected an error completion, got {entries:?}"),
            Err(err) => Err(err.into()),
        }
    }

    /// Collects `count` successful completions.
    pub fn completions(&self, count: usize) -> Result<Vec<CqEntry>> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            out.extend(self.cq().sread(count - out.len(), PATIENCE)?);
        }
        Ok(out)
    }
}

/// Listens on `SERVER_NODE`, connects from `CLIENT_NODE` and accepts.
/// Returns `(server, client)`; the server's connection-request event has
/// already been consumed.
pub fn connect_pair(
    switch: &Arc<LoopbackFabric>,
    server: ProviderConfig,
    client: ProviderConfig,
) -> Result<(Peer, Peer)> {
    let server = Node::open(switch, SERVER_NODE, server)?;
    let client = Node::open(switch, CLIENT_NODE, client)?;

    let listener = server.fabric.passive_ep(&Info {
        src_addr: Some(PeerAddr::new(SERVER_NODE, LISTEN_SEGMENT)),
        ..Info::default()
    })?;
    listener.bind_eq(&server.eq)?;
    listener.listen()?;

    let connector = thread::spawn(move || -> Result<Peer> {
        let ep = client.endpoint(&Info::default())?;
        ep.connect(Some(PeerAddr::new(SERVER_NODE, LISTEN_SEGMENT)))?;
        let event = client.eq.sread(PATIENCE, Flags::empty())?;
        ensure!(event.event == EventKind::Connected, "unexpected {event:?}");
        Ok(client.with_endpoint(ep, None))
    });

    let request = server.eq.sread(PATIENCE, Flags::empty())?;
    ensure!(request.event == EventKind::ConnReq, "unexpected {request:?}");
    let info = request.info.context("connection request without info")?;
    let ep = server.endpoint(&info)?;
    ep.accept()?;

    let client = connector
        .join()
        .map_err(|_| anyhow!("connector thread panicked"))??;
    Ok((server.with_endpoint(ep, Some(listener)), client))
}

/// Payload whose bytes encode `seq` so receivers can check ordering.
pub fn payload(seq: u64, len: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = (0..len).map(|i| (seq as usize + i) as u8).collect();
    let head = seq.to_le_bytes();
    let n = head.len().min(len);
    buf[..n].copy_from_slice(&head[..n]);
    buf
}

pub fn sequence_of(buf: &[u8]) -> Option<u64> {
    let head: [u8; 8] = buf.get(..8)?.try_into().ok()?;
    Some(u64::from_le_bytes(head))
}
