//! # dignode-core
//!
//! Peer-to-peer distribution core for opaque, content-addressed `.dig`
//! blobs. Each node watches a directory, announces the SHA-256 digests
//! it holds over a gossip mesh, and fetches whatever it is missing from
//! peers — over direct TCP or UDP when possible, over mapped ports,
//! hole-punched pairings, WebRTC data channels, or a mesh relay when
//! NATs get in the way. Two reachable nodes converge on identical blob
//! sets, keyed by digest.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        SUBSYSTEMS                                   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  store      directory index, digests, chunked reads, watcher       │
//! │  wire       the typed frame set every transport speaks             │
//! │  transport  TCP / UDP / WebRTC / relay channels                    │
//! │  nat        STUN, UPnP, NAT-PMP, hole punching                     │
//! │  mesh       gossip substrate client (announce/signal/relay)        │
//! │  connect    transport selection + persistent success registry      │
//! │  transfer   chunk protocol: download, serve, choke scheduling      │
//! │  announce   capability records in, download jobs out               │
//! │  node       the orchestrator owning all of the above               │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use dignode_core::{Node, NodeConfig};
//!
//! # async fn run() -> dignode_core::Result<()> {
//! let config = NodeConfig {
//!     dig_directory: "/var/lib/dignode/blobs".into(),
//!     namespace: "my-network".into(),
//!     ..Default::default()
//! };
//! let node = Node::new(config)?;
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod announce;
pub mod config;
pub mod connect;
pub mod error;
pub mod identity;
pub mod mesh;
pub mod nat;
pub mod node;
pub mod peers;
pub mod signaling;
pub mod store;
pub mod time;
pub mod transfer;
pub mod transport;
pub mod wire;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use identity::NodeId;
pub use node::{Node, NodeState, NodeStatus};
pub use store::{FileRecord, LocalStore, StoreEvent};
pub use transfer::TransferEvent;
pub use transport::TransportKind;
