//! Capability discovery.
//!
//! [`getinfo`] checks an application's hints against what the provider can
//! do and fills in everything the hints left open. Any unsatisfiable hint
//! yields `NoData`, mirroring "no provider matches".

use segfab_interconnect::{NodeId, SegmentId};
use tracing::debug;

use crate::av::{AvType, PeerAddr};
use crate::cm::ConnHandle;
use crate::context::Provider;
use crate::error::{FabricError, FabricResult};
use crate::flags::{Flags, EP_MSG_CAPS, EP_RDM_CAPS};
use crate::lock::Threading;

/// Name used for both the fabric and the provider.
pub const PROVIDER_NAME: &str = "segfab";
/// Wire protocol identifier.
pub const PROTO_SEGFAB: u32 = (1 << 31) | 1;
pub const PROTO_VERSION: u32 = 1;
/// Highest interface version understood.
pub const FI_VERSION: Version = Version::new(1, 3);
/// Transmit and receive contexts per endpoint.
pub const MAX_CTX_CNT: usize = 1;
/// Context count asking for a shared context.
pub const SHARED_CONTEXT: usize = usize::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EpType {
    #[default]
    Unspec,
    Msg,
    Rdm,
    Dgram,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProgressMode {
    #[default]
    Unspec,
    Auto,
    Manual,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MrMode {
    #[default]
    Unspec,
    Basic,
    Scalable,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddrFormat {
    #[default]
    Unspec,
    Segfab,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EpAttr {
    pub ep_type: EpType,
    /// Zero means unspecified.
    pub protocol: u32,
    pub protocol_version: u32,
    pub max_msg_size: usize,
    pub tx_ctx_cnt: usize,
    pub rx_ctx_cnt: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DomainAttr {
    pub name: Option<String>,
    pub threading: Threading,
    pub control_progress: ProgressMode,
    pub data_progress: ProgressMode,
    pub av_type: AvType,
    pub mr_mode: MrMode,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FabricAttr {
    pub name: Option<String>,
    pub prov_name: Option<String>,
}

/// Capabilities and attributes of one provider configuration; also used as
/// the hints passed to [`getinfo`].
#[derive(Clone, Debug, Default)]
pub struct Info {
    pub caps: Flags,
    pub addr_format: AddrFormat,
    pub src_addr: Option<PeerAddr>,
    pub dest_addr: Option<PeerAddr>,
    /// Pending connection carried by a connection-request event.
    pub handle: Option<ConnHandle>,
    pub ep_attr: EpAttr,
    pub tx_caps: Flags,
    pub rx_caps: Flags,
    pub domain_attr: DomainAttr,
    pub fabric_attr: FabricAttr,
}

impl Info {
    /// Sets `src_addr` from its byte encoding.
    pub fn set_src_addr(&mut self, raw: &[u8]) -> FabricResult<()> {
        self.src_addr = Some(PeerAddr::from_bytes(raw)?);
        Ok(())
    }

    /// Sets `dest_addr` from its byte encoding.
    pub fn set_dest_addr(&mut self, raw: &[u8]) -> FabricResult<()> {
        self.dest_addr = Some(PeerAddr::from_bytes(raw)?);
        Ok(())
    }
}

/// Resolves `node`/`service` strings: the node is a numeric node id, the
/// service a numeric segment id. Missing parts resolve to zero.
pub fn resolve_name(node: Option<&str>, service: Option<&str>) -> FabricResult<PeerAddr> {
    let node_id = match node {
        Some(node) => node
            .trim()
            .parse::<NodeId>()
            .map_err(|_| FabricError::NoData)?,
        None => 0,
    };
    let segment_id = match service {
        Some(service) => leading_number(service),
        None => 0,
    };
    debug!(node_id, segment_id, "resolved name");
    Ok(PeerAddr::new(node_id, segment_id))
}

fn leading_number(raw: &str) -> SegmentId {
    let digits: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}

/// Capability negotiation entry point.
pub fn getinfo(
    provider: &Provider,
    version: Version,
    node: Option<&str>,
    service: Option<&str>,
    flags: Flags,
    hints: Option<&Info>,
) -> FabricResult<Vec<Info>> {
    verify(provider, version, flags, hints)?;

    let source = flags.contains(Flags::SOURCE);
    let dest_addr = if node.is_some() && service.is_some() && !source {
        Some(resolve_name(node, service)?)
    } else {
        hints.and_then(|h| h.dest_addr)
    };
    let mut src_addr = if service.is_some() && source {
        resolve_name(node, service)?
    } else {
        hints.and_then(|h| h.src_addr).unwrap_or_default()
    };
    src_addr.node_id = provider.local_node_id();

    let hinted_domain = hints.map(|h| &h.domain_attr);
    let threading = match hinted_domain.map(|d| d.threading) {
        Some(t) if t != Threading::Unspec && t < Threading::Completion => t,
        _ => Threading::Completion,
    };
    let data_progress = match hinted_domain.map(|d| d.data_progress) {
        Some(ProgressMode::Auto) => ProgressMode::Auto,
        _ => ProgressMode::Manual,
    };
    let av_type = hinted_domain.map_or(AvType::Unspec, |d| d.av_type);

    let ep_type = match hints.map(|h| h.ep_attr.ep_type) {
        Some(EpType::Unspec) | None => EpType::Msg,
        Some(other) => other,
    };

    let info = Info {
        caps: ep_caps(hints)?,
        addr_format: AddrFormat::Segfab,
        src_addr: Some(src_addr),
        dest_addr,
        handle: None,
        ep_attr: EpAttr {
            ep_type,
            protocol: PROTO_SEGFAB,
            protocol_version: PROTO_VERSION,
            max_msg_size: provider.config().max_msg_size(),
            tx_ctx_cnt: MAX_CTX_CNT,
            rx_ctx_cnt: MAX_CTX_CNT,
        },
        tx_caps: hints.map_or(Flags::empty(), |h| h.tx_caps),
        rx_caps: hints.map_or(Flags::empty(), |h| h.rx_caps),
        domain_attr: DomainAttr {
            name: Some(PROVIDER_NAME.to_string()),
            threading,
            control_progress: ProgressMode::Auto,
            data_progress,
            av_type,
            mr_mode: MrMode::Scalable,
        },
        fabric_attr: FabricAttr {
            name: Some(PROVIDER_NAME.to_string()),
            prov_name: Some(PROVIDER_NAME.to_string()),
        },
    };
    Ok(vec![info])
}

fn verify(
    provider: &Provider,
    version: Version,
    flags: Flags,
    hints: Option<&Info>,
) -> FabricResult<()> {
    if version > FI_VERSION {
        return reject("interface version");
    }
    let Some(hints) = hints else {
        return Ok(());
    };

    if !flags.contains(Flags::SOURCE) {
        if let Some(src) = hints.src_addr {
            if src.node_id != provider.local_node_id() {
                return reject("source address is not local");
            }
        }
    }

    ep_caps(Some(hints))?;
    verify_ep_attr(provider, &hints.ep_attr)?;
    if !EP_MSG_CAPS.contains(hints.tx_caps) || !EP_MSG_CAPS.contains(hints.rx_caps) {
        return reject("context capabilities");
    }
    if hints.addr_format != AddrFormat::Unspec && hints.addr_format != AddrFormat::Segfab {
        return reject("address format");
    }
    if let Some(prov) = &hints.fabric_attr.prov_name {
        if prov != PROVIDER_NAME {
            return reject("provider name");
        }
    }
    if let Some(name) = &hints.fabric_attr.name {
        if name != PROVIDER_NAME {
            return reject("fabric name");
        }
    }
    if hints.domain_attr.mr_mode == MrMode::Basic {
        return reject("basic memory registration");
    }
    Ok(())
}

fn verify_ep_attr(provider: &Provider, attr: &EpAttr) -> FabricResult<()> {
    if attr.protocol != 0 && attr.protocol != PROTO_SEGFAB {
        return reject("protocol");
    }
    if attr.protocol_version > PROTO_VERSION {
        return reject("protocol version");
    }
    if attr.max_msg_size > provider.config().max_msg_size() {
        return reject("max message size");
    }
    if attr.tx_ctx_cnt == SHARED_CONTEXT || attr.rx_ctx_cnt == SHARED_CONTEXT {
        return reject("shared contexts");
    }
    if attr.tx_ctx_cnt > MAX_CTX_CNT || attr.rx_ctx_cnt > MAX_CTX_CNT {
        return reject("context count");
    }
    Ok(())
}

/// Capabilities granted for the hinted endpoint type.
fn ep_caps(hints: Option<&Info>) -> FabricResult<Flags> {
    let Some(hints) = hints else {
        return Ok(EP_MSG_CAPS);
    };
    let caps = match hints.ep_attr.ep_type {
        EpType::Unspec | EpType::Msg => EP_MSG_CAPS,
        EpType::Rdm | EpType::Dgram => EP_RDM_CAPS,
    };
    if !caps.contains(hints.caps) {
        return reject("capabilities");
    }
    Ok(if hints.caps.is_empty() { caps } else { hints.caps })
}

fn reject<T>(what: &'static str) -> FabricResult<T> {
    debug!(what, "hints cannot be satisfied");
    Err(FabricError::NoData)
}
