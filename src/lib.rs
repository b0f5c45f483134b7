//! A dynamic, resource-oriented client for the Kubernetes API.
//!
//! `kubedyn` talks to any cluster resource through one uniform object model:
//! kinds are resolved at runtime (built-ins, server discovery, or ad-hoc
//! registrations), and every object supports the same operations — get,
//! create, patch, delete, scale, wait, watch — plus the streaming
//! subresources (logs, exec, port-forward) where the kind offers them.
//!
//! # Example
//!
//! ```no_run
//! use kubedyn::{Client, ListParams};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kubedyn::Error> {
//!     let client = Client::try_default().await?;
//!     let lp = ListParams::default().labels("app=web");
//!     for pod in client.get("pods", &[], None, &lp, true).await? {
//!         println!("found {}", pod.name()?);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Typed wrappers exist for the built-in kinds:
//!
//! ```no_run
//! use kubedyn::{api::Pod, api::ExecParams, Client};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), kubedyn::Error> {
//!     let client = Client::try_default().await?;
//!     let pod = Pod::get(&client, "web-0").await?;
//!     let out = pod.exec(vec!["uname", "-a"], &ExecParams::new()).await?;
//!     println!("{}", out.stdout_str());
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod discovery;
mod error;
pub mod watch;

pub use crate::{
    api::{
        ApiObject, AttachParams, DeleteParams, ExecParams, ListParams, LogParams, PatchParams,
        PatchType, PortForward, PropagationPolicy, WaitMode,
    },
    auth::{AuthSource, Identity},
    client::Client,
    config::KubeconfigSet,
    discovery::{parse_kind, KindRef, ObjectClass},
    error::{Error, ErrorResponse, Result},
    watch::{WatchEvent, WatchPhase},
};
